use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionEvent {
    pub date: NaiveDate,
    pub amount: f64,
}

/// Raw daily history for one ticker, before monthly aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceHistory {
    pub ticker: String,
    pub currency: Option<String>,
    pub bars: Vec<DailyBar>,
    pub distributions: Vec<DistributionEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfProfile {
    pub symbol: String,
    pub name: String,
    pub currency: String,
}
