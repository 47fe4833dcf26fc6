use crate::domain::etf::TrackedEtf;
use crate::metrics::{Flag, MetricsSnapshot};
use anyhow::Context;
use chrono::NaiveDate;
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: i64 = 12;

type SnapshotRow = (
    NaiveDate,
    NaiveDate,
    NaiveDate,
    f64,
    f64,
    f64,
    f64,
    f64,
    String,
);

const SNAPSHOT_COLUMNS: &str = "calc_date, window_start, window_end, start_price, end_price, \
     total_distributions, nav_erosion_pct, true_return_pct, flag";

fn snapshot_from_row(row: SnapshotRow) -> anyhow::Result<MetricsSnapshot> {
    let (
        calc_date,
        window_start,
        window_end,
        start_price,
        end_price,
        total_distributions,
        nav_erosion_pct,
        true_return_pct,
        flag,
    ) = row;

    Ok(MetricsSnapshot {
        calc_date,
        window_start,
        window_end,
        start_price,
        end_price,
        total_distributions,
        nav_erosion_pct,
        true_return_pct,
        flag: flag
            .parse::<Flag>()
            .with_context(|| format!("invalid flag in DB for calc_date={calc_date}"))?,
    })
}

/// Appends a snapshot to the ETF's history. Existing rows are never updated.
pub async fn insert_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    etf_id: Uuid,
    snapshot: &MetricsSnapshot,
) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO metrics_snapshots (id, etf_id, calc_date, window_start, window_end, start_price, \
           end_price, total_distributions, nav_erosion_pct, true_return_pct, flag) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(id)
    .bind(etf_id)
    .bind(snapshot.calc_date)
    .bind(snapshot.window_start)
    .bind(snapshot.window_end)
    .bind(snapshot.start_price)
    .bind(snapshot.end_price)
    .bind(snapshot.total_distributions)
    .bind(snapshot.nav_erosion_pct)
    .bind(snapshot.true_return_pct)
    .bind(snapshot.flag.as_str())
    .execute(&mut **tx)
    .await
    .context("insert metrics_snapshots failed")?;
    Ok(id)
}

pub async fn latest_snapshot(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
) -> anyhow::Result<Option<MetricsSnapshot>> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM metrics_snapshots \
         WHERE etf_id = $1 \
         ORDER BY calc_date DESC, created_at DESC \
         LIMIT 1"
    ))
    .bind(etf_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("select latest metrics_snapshots failed (etf_id={etf_id})"))?;

    row.map(snapshot_from_row).transpose()
}

/// Newest first.
pub async fn snapshot_history(
    pool: &sqlx::PgPool,
    etf_id: Uuid,
    limit: i64,
) -> anyhow::Result<Vec<MetricsSnapshot>> {
    anyhow::ensure!(limit >= 1, "history limit must be >= 1 (got {limit})");

    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM metrics_snapshots \
         WHERE etf_id = $1 \
         ORDER BY calc_date DESC, created_at DESC \
         LIMIT $2"
    ))
    .bind(etf_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("select metrics_snapshots history failed")?;

    rows.into_iter().map(snapshot_from_row).collect()
}

/// Every active ETF paired with its most recent snapshot, if any.
pub async fn latest_for_active_etfs(
    pool: &sqlx::PgPool,
) -> anyhow::Result<Vec<(TrackedEtf, Option<MetricsSnapshot>)>> {
    let etfs = crate::storage::etfs::list_etfs(pool, true).await?;
    let mut out = Vec::with_capacity(etfs.len());
    for etf in etfs {
        let latest = latest_snapshot(pool, etf.id).await?;
        out.push((etf, latest));
    }
    Ok(out)
}
