use crate::metrics::Thresholds;
use anyhow::Context;
use std::collections::BTreeMap;

pub const DEFAULT_WARN_THRESHOLD_KEY: &str = "default_warn_threshold";
pub const DEFAULT_SELL_THRESHOLD_KEY: &str = "default_sell_threshold";

pub async fn get_setting(pool: &sqlx::PgPool, key: &str) -> anyhow::Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("select settings failed (key={key})"))?;
    Ok(row.map(|(v,)| v))
}

pub async fn set_setting(pool: &sqlx::PgPool, key: &str, value: &str) -> anyhow::Result<()> {
    let key = key.trim();
    anyhow::ensure!(!key.is_empty(), "setting key must be non-empty");

    sqlx::query(
        "INSERT INTO settings (key, value) VALUES ($1, $2) \
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("upsert settings failed (key={key})"))?;
    Ok(())
}

pub async fn all_settings(pool: &sqlx::PgPool) -> anyhow::Result<BTreeMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(pool)
        .await
        .context("select settings failed")?;
    Ok(rows.into_iter().collect())
}

/// Global thresholds: settings table first, then `fallback` per field.
pub async fn resolve_default_thresholds(
    pool: &sqlx::PgPool,
    fallback: Thresholds,
) -> anyhow::Result<Thresholds> {
    let settings = all_settings(pool).await?;
    Ok(thresholds_from_settings(&settings, fallback))
}

pub async fn set_default_thresholds(
    pool: &sqlx::PgPool,
    thresholds: Thresholds,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        thresholds.warn_threshold.is_finite() && thresholds.sell_threshold.is_finite(),
        "default thresholds must be finite"
    );
    if !thresholds.is_ordered() {
        tracing::warn!(?thresholds, "default thresholds are not ordered sell <= warn <= 0");
    }

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    for (key, value) in [
        (DEFAULT_WARN_THRESHOLD_KEY, thresholds.warn_threshold),
        (DEFAULT_SELL_THRESHOLD_KEY, thresholds.sell_threshold),
    ] {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("upsert settings failed (key={key})"))?;
    }
    tx.commit().await.context("commit transaction failed")?;
    Ok(())
}

pub fn thresholds_from_settings(
    settings: &BTreeMap<String, String>,
    fallback: Thresholds,
) -> Thresholds {
    Thresholds {
        warn_threshold: stored_fraction(settings, DEFAULT_WARN_THRESHOLD_KEY)
            .unwrap_or(fallback.warn_threshold),
        sell_threshold: stored_fraction(settings, DEFAULT_SELL_THRESHOLD_KEY)
            .unwrap_or(fallback.sell_threshold),
    }
}

fn stored_fraction(settings: &BTreeMap<String, String>, key: &str) -> Option<f64> {
    let raw = settings.get(key)?;
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable threshold setting");
            None
        }
    }
}
