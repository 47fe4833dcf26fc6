use crate::metrics::Observation;
use anyhow::{bail, ensure, Context};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Observation as it arrives from outside the engine (ISO-8601 date string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObservation {
    pub date: String,
    pub close_price: f64,
    #[serde(default)]
    pub distribution: f64,
}

impl RawObservation {
    fn validate_and_into_observation(
        self,
        seen_dates: &mut BTreeSet<NaiveDate>,
    ) -> anyhow::Result<Observation> {
        let date = NaiveDate::parse_from_str(self.date.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid observation date: {:?}", self.date))?;

        ensure!(
            self.close_price.is_finite(),
            "close_price must be finite on {date} (got {})",
            self.close_price
        );
        ensure!(
            self.distribution.is_finite(),
            "distribution must be finite on {date} (got {})",
            self.distribution
        );
        ensure!(
            self.distribution >= 0.0,
            "distribution must be non-negative on {date} (got {})",
            self.distribution
        );
        if !seen_dates.insert(date) {
            bail!("duplicate observation date: {date}");
        }

        Ok(Observation {
            date,
            close_price: self.close_price,
            distribution: self.distribution,
        })
    }
}

/// Checks a series at the point it enters the engine.
///
/// Non-positive prices pass through; the metric functions treat them as "no signal".
pub fn validate_observations(raw: Vec<RawObservation>) -> anyhow::Result<Vec<Observation>> {
    let mut seen_dates = BTreeSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for item in raw {
        out.push(item.validate_and_into_observation(&mut seen_dates)?);
    }
    Ok(out)
}

/// Same checks for observations that were already typed (e.g. produced by monthly aggregation).
pub fn validate_series(observations: &[Observation]) -> anyhow::Result<()> {
    let mut seen_dates = BTreeSet::new();
    for o in observations {
        ensure!(
            o.close_price.is_finite() && o.distribution.is_finite(),
            "non-finite values on {}",
            o.date
        );
        ensure!(
            o.distribution >= 0.0,
            "distribution must be non-negative on {} (got {})",
            o.date,
            o.distribution
        );
        ensure!(seen_dates.insert(o.date), "duplicate observation date: {}", o.date);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> Vec<RawObservation> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn accepts_well_formed_series() {
        let raw = parse(json!([
            {"date": "2024-01-31", "close_price": 20.0, "distribution": 0.2},
            {"date": "2024-02-29", "close_price": 19.0},
        ]));
        let out = validate_observations(raw).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].distribution, 0.0);
        assert_eq!(out[0].date, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
    }

    #[test]
    fn rejects_bad_dates_and_duplicates() {
        let raw = parse(json!([{"date": "2024/01/31", "close_price": 20.0}]));
        assert!(validate_observations(raw).is_err());

        let raw = parse(json!([
            {"date": "2024-01-31", "close_price": 20.0},
            {"date": "2024-01-31", "close_price": 21.0},
        ]));
        let err = validate_observations(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_non_finite_and_negative_values() {
        let nan = vec![RawObservation {
            date: "2024-01-31".to_string(),
            close_price: f64::NAN,
            distribution: 0.0,
        }];
        assert!(validate_observations(nan).is_err());

        let inf = vec![RawObservation {
            date: "2024-01-31".to_string(),
            close_price: 20.0,
            distribution: f64::INFINITY,
        }];
        assert!(validate_observations(inf).is_err());

        let negative = parse(json!([{"date": "2024-01-31", "close_price": 20.0, "distribution": -0.1}]));
        assert!(validate_observations(negative).is_err());
    }

    #[test]
    fn non_positive_prices_are_left_to_the_engine() {
        let raw = parse(json!([{"date": "2024-01-31", "close_price": 0.0}]));
        assert_eq!(validate_observations(raw).unwrap()[0].close_price, 0.0);
    }

    #[test]
    fn typed_series_check_flags_duplicates() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let o = Observation {
            date: d,
            close_price: 10.0,
            distribution: 0.0,
        };
        assert!(validate_series(&[o]).is_ok());
        assert!(validate_series(&[o, o]).is_err());
    }
}
