use crate::ingest::types::{DailyBar, DistributionEvent, EtfProfile, PriceHistory};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::collections::BTreeMap;

// Shape of the v8 chart endpoint (`/v8/finance/chart/{symbol}`), trimmed to the fields we use.

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResponse {
    pub chart: Chart,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chart {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ChartError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
    #[serde(default)]
    pub timestamp: Vec<i64>,
    #[serde(default)]
    pub events: Option<ChartEvents>,
    #[serde(default)]
    pub indicators: Option<Indicators>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    pub symbol: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub gmtoffset: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartEvents {
    #[serde(default)]
    pub dividends: BTreeMap<String, DividendEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DividendEvent {
    pub amount: f64,
    pub date: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Indicators {
    #[serde(default)]
    pub quote: Vec<QuoteIndicator>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteIndicator {
    #[serde(default)]
    pub close: Vec<Option<f64>>,
}

impl ChartResponse {
    fn into_result(self) -> Result<ChartResult> {
        if let Some(err) = self.chart.error {
            anyhow::bail!("chart error {}: {}", err.code, err.description);
        }
        self.chart
            .result
            .and_then(|r| r.into_iter().next())
            .context("chart response has no result")
    }

    pub fn into_history(self) -> Result<PriceHistory> {
        let result = self.into_result()?;
        let offset = result.meta.gmtoffset;

        let closes = result
            .indicators
            .as_ref()
            .and_then(|i| i.quote.first())
            .map(|q| q.close.as_slice())
            .unwrap_or_default();

        let mut bars = Vec::with_capacity(result.timestamp.len());
        for (idx, ts) in result.timestamp.iter().enumerate() {
            // Halted or partial sessions come back as null closes.
            let Some(close) = closes.get(idx).copied().flatten() else {
                continue;
            };
            if !close.is_finite() {
                continue;
            }
            bars.push(DailyBar {
                date: exchange_date(*ts, offset)?,
                close,
            });
        }

        let mut distributions = Vec::new();
        if let Some(events) = &result.events {
            for div in events.dividends.values() {
                distributions.push(DistributionEvent {
                    date: exchange_date(div.date, offset)?,
                    amount: div.amount,
                });
            }
        }
        distributions.sort_by_key(|d| d.date);

        Ok(PriceHistory {
            ticker: result.meta.symbol,
            currency: result.meta.currency,
            bars,
            distributions,
        })
    }

    pub fn into_profile(self) -> Result<EtfProfile> {
        let result = self.into_result()?;
        let ChartMeta {
            symbol,
            currency,
            long_name,
            short_name,
            ..
        } = result.meta;

        let name = short_name
            .or(long_name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| symbol.clone());

        Ok(EtfProfile {
            symbol,
            name,
            currency: currency.unwrap_or_else(|| "USD".to_string()),
        })
    }
}

fn exchange_date(ts: i64, gmtoffset: i64) -> Result<NaiveDate> {
    DateTime::from_timestamp(ts + gmtoffset, 0)
        .map(|dt| dt.date_naive())
        .with_context(|| format!("timestamp out of range: {ts}"))
}
