use crate::ingest::types::PriceHistory;
use crate::metrics::Observation;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;

type YearMonth = (i32, u32);

fn year_month(d: NaiveDate) -> YearMonth {
    (d.year(), d.month())
}

/// Reduces daily history to one observation per calendar month.
///
/// Each month keeps its last trading day's close; distributions are summed within the month.
/// Distributions paid in a month without any price bar are dropped.
pub fn aggregate_monthly(history: &PriceHistory) -> Vec<Observation> {
    let mut last_bar: BTreeMap<YearMonth, (NaiveDate, f64)> = BTreeMap::new();
    for bar in &history.bars {
        let entry = last_bar
            .entry(year_month(bar.date))
            .or_insert((bar.date, bar.close));
        if bar.date >= entry.0 {
            *entry = (bar.date, bar.close);
        }
    }

    let mut dist_by_month: BTreeMap<YearMonth, f64> = BTreeMap::new();
    for event in &history.distributions {
        *dist_by_month.entry(year_month(event.date)).or_insert(0.0) += event.amount;
    }

    let dropped = dist_by_month
        .keys()
        .filter(|ym| !last_bar.contains_key(ym))
        .count();
    if dropped > 0 {
        tracing::debug!(
            ticker = %history.ticker,
            dropped_months = dropped,
            "distributions outside priced months ignored"
        );
    }

    last_bar
        .into_iter()
        .map(|(ym, (date, close_price))| Observation {
            date,
            close_price,
            distribution: dist_by_month.get(&ym).copied().unwrap_or(0.0),
        })
        .collect()
}
