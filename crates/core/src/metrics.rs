use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One monthly data point for a tracked ETF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub close_price: f64,
    pub distribution: f64,
}

/// Variants are declared in increasing severity, so `Ord` ranks `Sell` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Flag {
    Ok,
    Warning,
    Sell,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Ok => "OK",
            Flag::Warning => "WARNING",
            Flag::Sell => "SELL",
        }
    }

    /// Severity class used by the dashboard for badges.
    pub fn severity_class(&self) -> &'static str {
        match self {
            Flag::Ok => "success",
            Flag::Warning => "warning",
            Flag::Sell => "danger",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "OK" => Ok(Flag::Ok),
            "WARNING" => Ok(Flag::Warning),
            "SELL" => Ok(Flag::Sell),
            other => anyhow::bail!("unknown flag: {other}"),
        }
    }
}

/// Warn/sell erosion thresholds as signed fractions (`-0.06` is -6%).
///
/// The expected configuration is `sell <= warn <= 0`, but nothing here enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warn_threshold: f64,
    pub sell_threshold: f64,
}

impl Thresholds {
    pub const DEFAULT: Thresholds = Thresholds {
        warn_threshold: -0.06,
        sell_threshold: -0.10,
    };

    pub fn new(warn_threshold: f64, sell_threshold: f64) -> Self {
        Self {
            warn_threshold,
            sell_threshold,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.sell_threshold <= self.warn_threshold && self.warn_threshold <= 0.0
    }

    pub fn classify(&self, nav_erosion_pct: f64) -> Flag {
        classify_flag(nav_erosion_pct, self.warn_threshold, self.sell_threshold)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub calc_date: NaiveDate,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub start_price: f64,
    pub end_price: f64,
    pub total_distributions: f64,
    pub nav_erosion_pct: f64,
    pub true_return_pct: f64,
    pub flag: Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub nav_erosion: String,
    pub true_return: String,
    pub total_distributions: String,
    pub price_change: String,
    pub flag: Flag,
    pub flag_class: &'static str,
}

impl MetricsSnapshot {
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            nav_erosion: format_pct(self.nav_erosion_pct),
            true_return: format_pct(self.true_return_pct),
            total_distributions: format_currency(self.total_distributions),
            price_change: format_currency(self.end_price - self.start_price),
            flag: self.flag,
            flag_class: self.flag.severity_class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyBreakdownRow {
    pub month: String,
    pub date: NaiveDate,
    pub close_price: f64,
    pub distribution: f64,
    pub cumulative_erosion_pct: f64,
}

/// Returned when a series is too short to define a start/end window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsufficientData {
    pub observations: usize,
}

impl fmt::Display for InsufficientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "insufficient data: need at least 2 observations (got {})",
            self.observations
        )
    }
}

impl std::error::Error for InsufficientData {}

pub fn compute_nav_erosion(start_price: f64, end_price: f64) -> f64 {
    if start_price <= 0.0 {
        return 0.0;
    }
    (end_price - start_price) / start_price
}

pub fn compute_true_return(start_price: f64, end_price: f64, total_distributions: f64) -> f64 {
    if start_price <= 0.0 {
        return 0.0;
    }
    ((end_price - start_price) + total_distributions) / start_price
}

/// Sell is checked before warn, and both bounds are inclusive. With a misordered pair
/// (`sell > warn`) mildly eroded values can land on `Sell`; that order is kept as is.
pub fn classify_flag(nav_erosion_pct: f64, warn_threshold: f64, sell_threshold: f64) -> Flag {
    if nav_erosion_pct <= sell_threshold {
        Flag::Sell
    } else if nav_erosion_pct <= warn_threshold {
        Flag::Warning
    } else {
        Flag::Ok
    }
}

pub fn compute_metrics_snapshot(
    observations: &[Observation],
    thresholds: Thresholds,
    calc_date: NaiveDate,
) -> Result<MetricsSnapshot, InsufficientData> {
    if observations.len() < 2 {
        return Err(InsufficientData {
            observations: observations.len(),
        });
    }

    let sorted = sorted_by_date(observations);
    let first = sorted[0];
    let last = sorted[sorted.len() - 1];

    let total_distributions: f64 = sorted.iter().map(|o| o.distribution).sum();
    let nav_erosion_pct = compute_nav_erosion(first.close_price, last.close_price);
    let true_return_pct =
        compute_true_return(first.close_price, last.close_price, total_distributions);

    Ok(MetricsSnapshot {
        calc_date,
        window_start: first.date,
        window_end: last.date,
        start_price: first.close_price,
        end_price: last.close_price,
        total_distributions,
        nav_erosion_pct,
        true_return_pct,
        flag: thresholds.classify(nav_erosion_pct),
    })
}

pub fn generate_monthly_breakdown(observations: &[Observation]) -> Vec<MonthlyBreakdownRow> {
    let sorted = sorted_by_date(observations);
    let Some(start_price) = sorted.first().map(|o| o.close_price) else {
        return Vec::new();
    };

    sorted
        .into_iter()
        .map(|o| MonthlyBreakdownRow {
            month: o.date.format("%Y-%m").to_string(),
            date: o.date,
            close_price: o.close_price,
            distribution: o.distribution,
            cumulative_erosion_pct: compute_nav_erosion(start_price, o.close_price),
        })
        .collect()
}

/// Average monthly distribution annualized, over the latest close.
pub fn compute_annualized_distribution_yield(observations: &[Observation]) -> f64 {
    let sorted = sorted_by_date(observations);
    let Some(latest) = sorted.last() else {
        return 0.0;
    };
    if latest.close_price <= 0.0 {
        return 0.0;
    }

    let total: f64 = sorted.iter().map(|o| o.distribution).sum();
    let monthly_avg = total / sorted.len() as f64;
    (monthly_avg * 12.0) / latest.close_price
}

pub fn format_pct(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

/// `$` then the signed amount: `$0.60`, `$-2.00`.
pub fn format_currency(value: f64) -> String {
    format!("${value:.2}")
}

// Stable: ties keep their input order.
fn sorted_by_date(observations: &[Observation]) -> Vec<Observation> {
    let mut sorted = observations.to_vec();
    sorted.sort_by_key(|o| o.date);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn obs(y: i32, m: u32, d: u32, close_price: f64, distribution: f64) -> Observation {
        Observation {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            close_price,
            distribution,
        }
    }

    fn q1_2024() -> Vec<Observation> {
        vec![
            obs(2024, 1, 31, 20.00, 0.20),
            obs(2024, 2, 29, 19.00, 0.20),
            obs(2024, 3, 31, 18.00, 0.20),
        ]
    }

    fn calc_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 2).unwrap()
    }

    #[test]
    fn erosion_is_zero_over_a_null_window() {
        for p in [0.01, 1.0, 18.37, 1_000.0] {
            assert_eq!(compute_nav_erosion(p, p), 0.0);
        }
    }

    #[test]
    fn non_positive_start_price_yields_zero() {
        for start in [0.0, -0.0, -5.0] {
            assert_eq!(compute_nav_erosion(start, 12.0), 0.0);
            assert_eq!(compute_true_return(start, 12.0, 3.0), 0.0);
        }
    }

    #[test]
    fn true_return_without_distributions_matches_erosion() {
        for (s, e) in [(20.0, 18.0), (10.0, 11.5), (7.25, 7.25)] {
            assert_eq!(compute_true_return(s, e, 0.0), compute_nav_erosion(s, e));
        }
    }

    #[test]
    fn flag_boundaries_are_inclusive_on_the_severe_side() {
        assert_eq!(classify_flag(-0.10, -0.06, -0.10), Flag::Sell);
        assert_eq!(classify_flag(-0.06, -0.06, -0.10), Flag::Warning);
        assert_eq!(classify_flag(-0.0599, -0.06, -0.10), Flag::Ok);
        assert_eq!(classify_flag(0.25, -0.06, -0.10), Flag::Ok);
        assert_eq!(classify_flag(-0.35, -0.06, -0.10), Flag::Sell);
    }

    #[test]
    fn misordered_thresholds_check_sell_first() {
        // sell above warn: a mild -2% already counts as SELL.
        assert_eq!(classify_flag(-0.02, -0.10, -0.01), Flag::Sell);
        assert_eq!(classify_flag(0.0, -0.10, -0.01), Flag::Ok);
        assert!(!Thresholds::new(-0.10, -0.01).is_ordered());
        assert!(Thresholds::DEFAULT.is_ordered());
    }

    #[test]
    fn snapshot_for_a_declining_quarter() {
        let snap = compute_metrics_snapshot(&q1_2024(), Thresholds::DEFAULT, calc_date()).unwrap();

        assert_eq!(snap.calc_date, calc_date());
        assert_eq!(snap.window_start, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
        assert_eq!(snap.window_end, NaiveDate::from_ymd_opt(2024, 3, 31).unwrap());
        assert_eq!(snap.start_price, 20.0);
        assert_eq!(snap.end_price, 18.0);
        assert_abs_diff_eq!(snap.total_distributions, 0.60, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.nav_erosion_pct, -0.10, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.true_return_pct, -0.07, epsilon = 1e-12);
        assert_eq!(snap.flag, Flag::Sell);
    }

    #[test]
    fn snapshot_requires_two_observations() {
        let err = compute_metrics_snapshot(&[], Thresholds::DEFAULT, calc_date()).unwrap_err();
        assert_eq!(err, InsufficientData { observations: 0 });

        let one = [obs(2024, 1, 31, 20.0, 0.2)];
        let err = compute_metrics_snapshot(&one, Thresholds::DEFAULT, calc_date()).unwrap_err();
        assert_eq!(err.observations, 1);
    }

    #[test]
    fn snapshot_and_breakdown_ignore_input_order() {
        let sorted = q1_2024();
        let mut shuffled = sorted.clone();
        shuffled.swap(0, 2);
        shuffled.swap(1, 2);

        assert_eq!(
            compute_metrics_snapshot(&sorted, Thresholds::DEFAULT, calc_date()),
            compute_metrics_snapshot(&shuffled, Thresholds::DEFAULT, calc_date()),
        );
        assert_eq!(
            generate_monthly_breakdown(&sorted),
            generate_monthly_breakdown(&shuffled)
        );
    }

    #[test]
    fn snapshots_differ_only_by_calc_date() {
        let later = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let a = compute_metrics_snapshot(&q1_2024(), Thresholds::DEFAULT, calc_date()).unwrap();
        let b = compute_metrics_snapshot(&q1_2024(), Thresholds::DEFAULT, later).unwrap();
        assert_ne!(a, b);
        assert_eq!(MetricsSnapshot { calc_date: later, ..a }, b);
    }

    #[test]
    fn snapshot_with_degenerate_start_price_reports_no_signal() {
        let series = [obs(2024, 1, 31, 0.0, 0.1), obs(2024, 2, 29, 10.0, 0.1)];
        let snap = compute_metrics_snapshot(&series, Thresholds::DEFAULT, calc_date()).unwrap();
        assert_eq!(snap.nav_erosion_pct, 0.0);
        assert_eq!(snap.true_return_pct, 0.0);
        assert_eq!(snap.flag, Flag::Ok);
    }

    #[test]
    fn breakdown_tracks_cumulative_erosion_from_first_row() {
        let rows = generate_monthly_breakdown(&q1_2024());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].month, "2024-01");
        assert_eq!(rows[0].cumulative_erosion_pct, 0.0);
        assert_abs_diff_eq!(rows[1].cumulative_erosion_pct, -0.05, epsilon = 1e-12);
        assert_abs_diff_eq!(rows[2].cumulative_erosion_pct, -0.10, epsilon = 1e-12);
        assert_eq!(rows[2].month, "2024-03");
        assert_eq!(rows[2].distribution, 0.20);
    }

    #[test]
    fn breakdown_of_empty_series_is_empty() {
        assert!(generate_monthly_breakdown(&[]).is_empty());
        let single = generate_monthly_breakdown(&[obs(2024, 6, 28, 15.0, 0.0)]);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].cumulative_erosion_pct, 0.0);
    }

    #[test]
    fn annualized_yield_uses_latest_close() {
        // 0.60 over 3 months -> 0.20/month -> 2.40/yr over 18.00
        let y = compute_annualized_distribution_yield(&q1_2024());
        assert_abs_diff_eq!(y, 2.40 / 18.0, epsilon = 1e-12);
    }

    #[test]
    fn annualized_yield_degenerate_inputs_are_zero() {
        assert_eq!(compute_annualized_distribution_yield(&[]), 0.0);
        let series = [obs(2024, 1, 31, 10.0, 0.1), obs(2024, 2, 29, 0.0, 0.1)];
        assert_eq!(compute_annualized_distribution_yield(&series), 0.0);
    }

    #[test]
    fn stored_flag_round_trips_and_reclassifies() {
        let snap = compute_metrics_snapshot(&q1_2024(), Thresholds::DEFAULT, calc_date()).unwrap();
        let stored = serde_json::to_value(&snap).unwrap();
        assert_eq!(stored["flag"], "SELL");

        let reloaded: MetricsSnapshot = serde_json::from_value(stored).unwrap();
        assert_eq!(reloaded, snap);
        assert_eq!(Thresholds::DEFAULT.classify(reloaded.nav_erosion_pct), snap.flag);
        assert_eq!(snap.flag.as_str().parse::<Flag>().unwrap(), snap.flag);
        assert!("HOLD".parse::<Flag>().is_err());
    }

    #[test]
    fn summary_formats_like_the_dashboard() {
        let snap = compute_metrics_snapshot(&q1_2024(), Thresholds::DEFAULT, calc_date()).unwrap();
        let s = snap.summary();
        assert_eq!(s.nav_erosion, "-10.00%");
        assert_eq!(s.true_return, "-7.00%");
        assert_eq!(s.total_distributions, "$0.60");
        assert_eq!(s.price_change, "$-2.00");
        assert_eq!(s.flag_class, "danger");
    }

    #[test]
    fn currency_keeps_the_sign_after_the_symbol() {
        assert_eq!(format_currency(0.6), "$0.60");
        assert_eq!(format_currency(-2.0), "$-2.00");
        assert_eq!(format_currency(0.0), "$0.00");
    }
}
