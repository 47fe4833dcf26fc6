use anyhow::Context;
use chrono::NaiveDate;
use navwatch_core::domain::etf::TrackedEtf;
use navwatch_core::metrics::{MetricsSnapshot, Observation};

const HEADER: [&str; 8] = [
    "ETF",
    "Ticker",
    "Date",
    "Close Price",
    "Distribution",
    "NAV Erosion %",
    "True Return %",
    "Flag",
];

pub struct EtfExport {
    pub etf: TrackedEtf,
    /// Newest first, as stored.
    pub observations: Vec<Observation>,
    pub metrics: Option<MetricsSnapshot>,
}

pub fn export_filename(today: NaiveDate) -> String {
    format!("nav_erosion_export_{}.csv", today.format("%Y%m%d"))
}

/// One line per stored observation; the ETF's latest metrics repeat on each of its lines.
pub fn render_csv(rows: &[EtfExport]) -> anyhow::Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(HEADER)?;

    for row in rows {
        let (erosion, true_return, flag) = match &row.metrics {
            Some(m) => (
                format!("{:.2}", m.nav_erosion_pct * 100.0),
                format!("{:.2}", m.true_return_pct * 100.0),
                m.flag.as_str().to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        for o in &row.observations {
            let date = o.date.to_string();
            let close = format!("{:.2}", o.close_price);
            let distribution = format!("{:.4}", o.distribution);
            wtr.write_record([
                row.etf.name.as_str(),
                row.etf.ticker.as_str(),
                date.as_str(),
                close.as_str(),
                distribution.as_str(),
                erosion.as_str(),
                true_return.as_str(),
                flag.as_str(),
            ])?;
        }
    }

    let bytes = wtr
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flush csv writer failed: {}", e.error()))?;
    String::from_utf8(bytes).context("csv output is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use navwatch_core::domain::etf::ThresholdOverride;
    use navwatch_core::metrics::{compute_metrics_snapshot, Thresholds};
    use uuid::Uuid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn etf(name: &str, ticker: &str) -> TrackedEtf {
        TrackedEtf {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ticker: ticker.to_string(),
            thresholds: ThresholdOverride::default(),
            added_date: d(2024, 1, 1),
            active: true,
        }
    }

    #[test]
    fn renders_observations_with_latest_metrics() {
        let observations = vec![
            Observation { date: d(2024, 3, 31), close_price: 18.0, distribution: 0.2 },
            Observation { date: d(2024, 2, 29), close_price: 19.0, distribution: 0.2 },
            Observation { date: d(2024, 1, 31), close_price: 20.0, distribution: 0.2 },
        ];
        let metrics = compute_metrics_snapshot(&observations, Thresholds::DEFAULT, d(2024, 4, 2)).ok();

        let rows = vec![
            EtfExport {
                etf: etf("Global X NASDAQ 100 Covered Call, Inc", "QYLD"),
                observations,
                metrics,
            },
            EtfExport {
                etf: etf("Fresh Fund", "NEW"),
                observations: vec![Observation {
                    date: d(2024, 3, 31),
                    close_price: 10.0,
                    distribution: 0.0,
                }],
                metrics: None,
            },
        ];

        let out = render_csv(&rows).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[0],
            "ETF,Ticker,Date,Close Price,Distribution,NAV Erosion %,True Return %,Flag"
        );
        assert_eq!(
            lines[1],
            "\"Global X NASDAQ 100 Covered Call, Inc\",QYLD,2024-03-31,18.00,0.2000,-10.00,-7.00,SELL"
        );
        assert_eq!(lines[4], "Fresh Fund,NEW,2024-03-31,10.00,0.0000,,,");
    }

    #[test]
    fn filename_carries_the_export_date() {
        assert_eq!(export_filename(d(2024, 4, 2)), "nav_erosion_export_20240402.csv");
    }
}
