use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Days counted per requested month when sizing the fetch window.
const DAYS_PER_MONTH: i64 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Window ending today (UTC) and reaching `months * 31` days back.
pub fn history_window(months: u32, now_utc: DateTime<Utc>) -> anyhow::Result<HistoryWindow> {
    anyhow::ensure!(
        (1..=240).contains(&months),
        "history months must be 1..=240 (got {months})"
    );
    let end = now_utc.date_naive();
    let start = end
        .checked_sub_signed(Duration::days(i64::from(months) * DAYS_PER_MONTH))
        .context("history window start out of range")?;
    Ok(HistoryWindow { start, end })
}

/// Evaluation date for a metrics snapshot: explicit `YYYY-MM-DD`, or today's UTC date.
pub fn resolve_calc_date(
    calc_date_arg: Option<&str>,
    now_utc: DateTime<Utc>,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = calc_date_arg {
        return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid calc date: {s:?}"));
    }
    Ok(now_utc.date_naive())
}
