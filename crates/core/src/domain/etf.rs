use crate::metrics::Thresholds;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEtf {
    pub id: Uuid,
    pub name: String,
    pub ticker: String,
    pub thresholds: ThresholdOverride,
    pub added_date: NaiveDate,
    pub active: bool,
}

/// Per-ETF threshold overrides. Unset fields fall back to the global defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    pub warn_threshold: Option<f64>,
    pub sell_threshold: Option<f64>,
}

impl ThresholdOverride {
    pub fn resolve(&self, defaults: Thresholds) -> Thresholds {
        Thresholds {
            warn_threshold: self.warn_threshold.unwrap_or(defaults.warn_threshold),
            sell_threshold: self.sell_threshold.unwrap_or(defaults.sell_threshold),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("warn_threshold", self.warn_threshold),
            ("sell_threshold", self.sell_threshold),
        ] {
            if let Some(v) = value {
                anyhow::ensure!(v.is_finite(), "{field} must be finite (got {v})");
            }
        }
        Ok(())
    }
}

pub fn normalize_ticker(ticker: &str) -> anyhow::Result<String> {
    let ticker = ticker.trim().to_ascii_uppercase();
    anyhow::ensure!(!ticker.is_empty(), "ticker must be non-empty");
    anyhow::ensure!(
        !ticker.chars().any(char::is_whitespace),
        "ticker must not contain whitespace: {ticker}"
    );
    Ok(ticker)
}
