use crate::domain::etf::{normalize_ticker, ThresholdOverride, TrackedEtf};
use anyhow::Context;
use chrono::NaiveDate;
use uuid::Uuid;

type EtfRow = (Uuid, String, String, Option<f64>, Option<f64>, NaiveDate, bool);

const ETF_COLUMNS: &str =
    "id, name, ticker, warn_threshold, sell_threshold, added_date, active";

fn etf_from_row(row: EtfRow) -> TrackedEtf {
    let (id, name, ticker, warn_threshold, sell_threshold, added_date, active) = row;
    TrackedEtf {
        id,
        name,
        ticker,
        thresholds: ThresholdOverride {
            warn_threshold,
            sell_threshold,
        },
        added_date,
        active,
    }
}

/// Inserts a new tracked ETF. Returns `None` when the ticker is already tracked.
pub async fn add_etf(
    pool: &sqlx::PgPool,
    name: &str,
    ticker: &str,
    thresholds: ThresholdOverride,
    added_date: NaiveDate,
) -> anyhow::Result<Option<TrackedEtf>> {
    let ticker = normalize_ticker(ticker)?;
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "name must be non-empty");
    thresholds.validate()?;

    let row = sqlx::query_as::<_, EtfRow>(&format!(
        "INSERT INTO tracked_etfs (id, name, ticker, warn_threshold, sell_threshold, added_date, active) \
         VALUES ($1, $2, $3, $4, $5, $6, TRUE) \
         ON CONFLICT (ticker) DO NOTHING \
         RETURNING {ETF_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(&ticker)
    .bind(thresholds.warn_threshold)
    .bind(thresholds.sell_threshold)
    .bind(added_date)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("insert tracked_etfs failed (ticker={ticker})"))?;

    Ok(row.map(etf_from_row))
}

/// Soft delete: the ETF stays in the table but drops off the dashboard and refresh runs.
pub async fn deactivate_etf(pool: &sqlx::PgPool, etf_id: Uuid) -> anyhow::Result<bool> {
    let res = sqlx::query("UPDATE tracked_etfs SET active = FALSE WHERE id = $1")
        .bind(etf_id)
        .execute(pool)
        .await
        .context("deactivate tracked_etfs failed")?;
    Ok(res.rows_affected() > 0)
}

/// Removes the ETF together with its observations and snapshot history.
pub async fn delete_etf(pool: &sqlx::PgPool, etf_id: Uuid) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM tracked_etfs WHERE id = $1")
        .bind(etf_id)
        .execute(pool)
        .await
        .context("delete tracked_etfs failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_etfs(pool: &sqlx::PgPool, active_only: bool) -> anyhow::Result<Vec<TrackedEtf>> {
    let sql = if active_only {
        format!("SELECT {ETF_COLUMNS} FROM tracked_etfs WHERE active ORDER BY name ASC, ticker ASC")
    } else {
        format!("SELECT {ETF_COLUMNS} FROM tracked_etfs ORDER BY name ASC, ticker ASC")
    };

    let rows = sqlx::query_as::<_, EtfRow>(&sql)
        .fetch_all(pool)
        .await
        .context("select tracked_etfs failed")?;
    Ok(rows.into_iter().map(etf_from_row).collect())
}

pub async fn get_etf(pool: &sqlx::PgPool, etf_id: Uuid) -> anyhow::Result<Option<TrackedEtf>> {
    let row = sqlx::query_as::<_, EtfRow>(&format!(
        "SELECT {ETF_COLUMNS} FROM tracked_etfs WHERE id = $1"
    ))
    .bind(etf_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("select tracked_etfs failed (id={etf_id})"))?;
    Ok(row.map(etf_from_row))
}

pub async fn get_etf_by_ticker(
    pool: &sqlx::PgPool,
    ticker: &str,
) -> anyhow::Result<Option<TrackedEtf>> {
    let ticker = normalize_ticker(ticker)?;
    let row = sqlx::query_as::<_, EtfRow>(&format!(
        "SELECT {ETF_COLUMNS} FROM tracked_etfs WHERE ticker = $1"
    ))
    .bind(&ticker)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("select tracked_etfs failed (ticker={ticker})"))?;
    Ok(row.map(etf_from_row))
}

pub async fn update_thresholds(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
    thresholds: ThresholdOverride,
) -> anyhow::Result<bool> {
    thresholds.validate()?;
    if let (Some(warn), Some(sell)) = (thresholds.warn_threshold, thresholds.sell_threshold) {
        if sell > warn {
            // Stored as given; classification checks sell first, so this widens SELL.
            tracing::warn!(%etf_id, warn, sell, "sell threshold is above warn threshold");
        }
    }

    let res = sqlx::query(
        "UPDATE tracked_etfs SET warn_threshold = $2, sell_threshold = $3 WHERE id = $1",
    )
    .bind(etf_id)
    .bind(thresholds.warn_threshold)
    .bind(thresholds.sell_threshold)
    .execute(pool)
    .await
    .context("update tracked_etfs thresholds failed")?;
    Ok(res.rows_affected() > 0)
}
