use crate::domain::contract::validate_series;
use crate::domain::etf::TrackedEtf;
use crate::ingest::monthly::aggregate_monthly;
use crate::ingest::provider::MarketDataClient;
use crate::metrics::{compute_metrics_snapshot, MetricsSnapshot, Observation, Thresholds};
use crate::storage;
use crate::time::window::HistoryWindow;
use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Inputs shared by every ETF in one refresh run.
#[derive(Debug, Clone, Copy)]
pub struct RefreshContext {
    pub window: HistoryWindow,
    pub calc_date: NaiveDate,
    pub default_thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub etf_id: Uuid,
    pub ticker: String,
    pub observations: usize,
    pub snapshot: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub etf_id: Uuid,
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub refreshed: Vec<RefreshOutcome>,
    /// ETFs whose refresh lock was held by another run.
    pub skipped: Vec<String>,
    pub failures: Vec<RefreshFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub ticker: String,
    pub thresholds: Thresholds,
    pub observations: Vec<Observation>,
    pub snapshot: Option<MetricsSnapshot>,
}

/// Fetches daily history and reduces it to a validated monthly series.
pub async fn fetch_monthly_observations(
    client: &dyn MarketDataClient,
    ticker: &str,
    window: HistoryWindow,
) -> anyhow::Result<Vec<Observation>> {
    let (history, _raw) = client
        .fetch_history(ticker, window.start, window.end)
        .await
        .with_context(|| format!("{} fetch failed for {ticker}", client.provider_name()))?;

    let observations = aggregate_monthly(&history);
    validate_series(&observations).with_context(|| format!("bad monthly series for {ticker}"))?;
    Ok(observations)
}

/// Runs the engine, treating a too-short series as "no snapshot yet".
pub fn evaluate(
    ticker: &str,
    observations: &[Observation],
    thresholds: Thresholds,
    calc_date: NaiveDate,
) -> Option<MetricsSnapshot> {
    match compute_metrics_snapshot(observations, thresholds, calc_date) {
        Ok(snapshot) => Some(snapshot),
        Err(insufficient) => {
            tracing::info!(%ticker, %insufficient, "no metrics snapshot");
            None
        }
    }
}

/// Fetch and compute without touching storage.
pub async fn compute_preview(
    client: &dyn MarketDataClient,
    ticker: &str,
    thresholds: Thresholds,
    window: HistoryWindow,
    calc_date: NaiveDate,
) -> anyhow::Result<Preview> {
    let observations = fetch_monthly_observations(client, ticker, window).await?;
    let snapshot = evaluate(ticker, &observations, thresholds, calc_date);
    Ok(Preview {
        ticker: ticker.to_string(),
        thresholds,
        observations,
        snapshot,
    })
}

/// Refreshes one ETF: new series replaces the stored one and a snapshot is appended.
///
/// Returns `Ok(None)` if another refresh of the same ETF is in progress.
pub async fn refresh_etf(
    pool: &sqlx::PgPool,
    client: &dyn MarketDataClient,
    etf: &TrackedEtf,
    ctx: RefreshContext,
) -> anyhow::Result<Option<RefreshOutcome>> {
    let Some(lock) = storage::lock::try_acquire_etf_lock(pool, etf.id).await? else {
        tracing::warn!(ticker = %etf.ticker, "refresh lock not acquired; another run in progress");
        return Ok(None);
    };

    let res = refresh_locked(pool, client, etf, ctx).await;

    if let Err(err) = lock.release().await {
        tracing::warn!(ticker = %etf.ticker, error = %err, "failed to release refresh lock");
    }
    res.map(Some)
}

async fn refresh_locked(
    pool: &sqlx::PgPool,
    client: &dyn MarketDataClient,
    etf: &TrackedEtf,
    ctx: RefreshContext,
) -> anyhow::Result<RefreshOutcome> {
    let observations = fetch_monthly_observations(client, &etf.ticker, ctx.window).await?;
    let thresholds = etf.thresholds.resolve(ctx.default_thresholds);
    let snapshot = evaluate(&etf.ticker, &observations, thresholds, ctx.calc_date);

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    let stored = storage::observations::replace_observations(&mut tx, etf.id, &observations).await?;
    if let Some(snapshot) = &snapshot {
        storage::snapshots::insert_snapshot(&mut tx, etf.id, snapshot).await?;
    }
    tx.commit().await.context("commit transaction failed")?;

    tracing::info!(
        ticker = %etf.ticker,
        observations = stored,
        flag = snapshot.as_ref().map(|s| s.flag.as_str()),
        nav_erosion_pct = snapshot.as_ref().map(|s| s.nav_erosion_pct),
        "refreshed ETF"
    );

    Ok(RefreshOutcome {
        etf_id: etf.id,
        ticker: etf.ticker.clone(),
        observations: observations.len(),
        snapshot,
    })
}

/// Merges hand-entered observations into the stored series and appends a snapshot
/// computed over the merged series. Incoming rows win on a date clash.
///
/// Returns `Ok(None)` if a refresh of the same ETF is in progress.
pub async fn record_observations(
    pool: &sqlx::PgPool,
    etf: &TrackedEtf,
    observations: &[Observation],
    default_thresholds: Thresholds,
    calc_date: NaiveDate,
) -> anyhow::Result<Option<RefreshOutcome>> {
    let Some(lock) = storage::lock::try_acquire_etf_lock(pool, etf.id).await? else {
        tracing::warn!(ticker = %etf.ticker, "refresh lock not acquired; another run in progress");
        return Ok(None);
    };

    let res = record_locked(pool, etf, observations, default_thresholds, calc_date).await;

    if let Err(err) = lock.release().await {
        tracing::warn!(ticker = %etf.ticker, error = %err, "failed to release refresh lock");
    }
    res.map(Some)
}

async fn record_locked(
    pool: &sqlx::PgPool,
    etf: &TrackedEtf,
    observations: &[Observation],
    default_thresholds: Thresholds,
    calc_date: NaiveDate,
) -> anyhow::Result<RefreshOutcome> {
    let stored = storage::observations::list_observations(pool, etf.id, None).await?;
    let series = merge_series(stored, observations);
    let thresholds = etf.thresholds.resolve(default_thresholds);
    let snapshot = evaluate(&etf.ticker, &series, thresholds, calc_date);

    let mut tx = pool.begin().await.context("begin transaction failed")?;
    for o in observations {
        storage::observations::upsert_observation(&mut tx, etf.id, o).await?;
    }
    if let Some(snapshot) = &snapshot {
        storage::snapshots::insert_snapshot(&mut tx, etf.id, snapshot).await?;
    }
    tx.commit().await.context("commit transaction failed")?;

    tracing::info!(
        ticker = %etf.ticker,
        recorded = observations.len(),
        series = series.len(),
        flag = snapshot.as_ref().map(|s| s.flag.as_str()),
        "recorded observations"
    );

    Ok(RefreshOutcome {
        etf_id: etf.id,
        ticker: etf.ticker.clone(),
        observations: series.len(),
        snapshot,
    })
}

fn merge_series(stored: Vec<Observation>, incoming: &[Observation]) -> Vec<Observation> {
    let mut by_date: BTreeMap<NaiveDate, Observation> =
        stored.into_iter().map(|o| (o.date, o)).collect();
    for o in incoming {
        by_date.insert(o.date, *o);
    }
    by_date.into_values().collect()
}

/// Refreshes every ETF in `etfs`, continuing past individual failures.
pub async fn refresh_many(
    pool: &sqlx::PgPool,
    client: &dyn MarketDataClient,
    etfs: &[TrackedEtf],
    ctx: RefreshContext,
) -> RefreshSummary {
    let mut summary = RefreshSummary::default();
    for etf in etfs {
        match refresh_etf(pool, client, etf, ctx).await {
            Ok(Some(outcome)) => summary.refreshed.push(outcome),
            Ok(None) => summary.skipped.push(etf.ticker.clone()),
            Err(err) => {
                tracing::error!(ticker = %etf.ticker, error = %format!("{err:#}"), "refresh failed");
                summary.failures.push(RefreshFailure {
                    etf_id: etf.id,
                    ticker: etf.ticker.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    summary
}

pub async fn refresh_all(
    pool: &sqlx::PgPool,
    client: &dyn MarketDataClient,
    ctx: RefreshContext,
) -> anyhow::Result<RefreshSummary> {
    let etfs = storage::etfs::list_etfs(pool, true).await?;
    let summary = refresh_many(pool, client, &etfs, ctx).await;
    tracing::info!(
        refreshed = summary.refreshed.len(),
        skipped = summary.skipped.len(),
        failures = summary.failures.len(),
        "refresh run complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{DailyBar, DistributionEvent, EtfProfile, PriceHistory};
    use crate::metrics::Flag;
    use approx::assert_abs_diff_eq;
    use serde_json::{json, Value};

    struct StubClient {
        history: PriceHistory,
    }

    #[async_trait::async_trait]
    impl MarketDataClient for StubClient {
        fn provider_name(&self) -> &'static str {
            "stub"
        }

        async fn fetch_history(
            &self,
            ticker: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> anyhow::Result<(PriceHistory, Value)> {
            anyhow::ensure!(ticker == self.history.ticker, "unknown ticker {ticker}");
            let mut history = self.history.clone();
            history.bars.retain(|b| b.date >= start && b.date <= end);
            history.distributions.retain(|d| d.date >= start && d.date <= end);
            Ok((history, json!({"source": "stub"})))
        }

        async fn fetch_profile(&self, ticker: &str) -> anyhow::Result<EtfProfile> {
            Ok(EtfProfile {
                symbol: ticker.to_string(),
                name: ticker.to_string(),
                currency: "USD".to_string(),
            })
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn stub() -> StubClient {
        StubClient {
            history: PriceHistory {
                ticker: "QYLD".to_string(),
                currency: Some("USD".to_string()),
                bars: vec![
                    DailyBar { date: d(2024, 1, 2), close: 20.5 },
                    DailyBar { date: d(2024, 1, 31), close: 20.0 },
                    DailyBar { date: d(2024, 2, 29), close: 19.0 },
                    DailyBar { date: d(2024, 3, 28), close: 18.0 },
                ],
                distributions: vec![
                    DistributionEvent { date: d(2024, 1, 22), amount: 0.2 },
                    DistributionEvent { date: d(2024, 2, 20), amount: 0.2 },
                    DistributionEvent { date: d(2024, 3, 18), amount: 0.2 },
                ],
            },
        }
    }

    fn window(start: NaiveDate, end: NaiveDate) -> HistoryWindow {
        HistoryWindow { start, end }
    }

    #[tokio::test]
    async fn preview_runs_the_engine_on_monthly_data() {
        let client = stub();
        let preview = compute_preview(
            &client,
            "QYLD",
            Thresholds::DEFAULT,
            window(d(2024, 1, 1), d(2024, 3, 31)),
            d(2024, 4, 2),
        )
        .await
        .unwrap();

        assert_eq!(preview.observations.len(), 3);
        let snap = preview.snapshot.unwrap();
        assert_eq!(snap.window_start, d(2024, 1, 31));
        assert_eq!(snap.window_end, d(2024, 3, 28));
        assert_abs_diff_eq!(snap.nav_erosion_pct, -0.10, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.true_return_pct, -0.07, epsilon = 1e-12);
        assert_eq!(snap.flag, Flag::Sell);
    }

    #[tokio::test]
    async fn preview_with_one_month_has_no_snapshot() {
        let client = stub();
        let preview = compute_preview(
            &client,
            "QYLD",
            Thresholds::DEFAULT,
            window(d(2024, 3, 1), d(2024, 3, 31)),
            d(2024, 4, 2),
        )
        .await
        .unwrap();

        assert_eq!(preview.observations.len(), 1);
        assert!(preview.snapshot.is_none());
    }

    #[tokio::test]
    async fn fetch_errors_name_the_provider() {
        let client = stub();
        let err = fetch_monthly_observations(&client, "JEPI", window(d(2024, 1, 1), d(2024, 3, 31)))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("stub fetch failed for JEPI"));
    }

    #[test]
    fn merged_series_prefers_incoming_rows() {
        let stored = vec![
            Observation { date: d(2024, 2, 29), close_price: 19.0, distribution: 0.2 },
            Observation { date: d(2024, 1, 31), close_price: 20.0, distribution: 0.2 },
        ];
        let incoming = [
            Observation { date: d(2024, 2, 29), close_price: 18.5, distribution: 0.25 },
            Observation { date: d(2024, 3, 31), close_price: 18.0, distribution: 0.2 },
        ];

        let merged = merge_series(stored, &incoming);
        let dates: Vec<NaiveDate> = merged.iter().map(|o| o.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 31), d(2024, 2, 29), d(2024, 3, 31)]);
        assert_eq!(merged[1].close_price, 18.5);
        assert_eq!(merged[1].distribution, 0.25);
    }

    #[test]
    fn evaluate_uses_resolved_thresholds() {
        let obs = [
            Observation { date: d(2024, 1, 31), close_price: 20.0, distribution: 0.0 },
            Observation { date: d(2024, 2, 29), close_price: 18.9, distribution: 0.0 },
        ];
        // -5.5%: OK under defaults, WARNING under a tighter -5% warn.
        let loose = evaluate("QYLD", &obs, Thresholds::DEFAULT, d(2024, 3, 1)).unwrap();
        assert_eq!(loose.flag, Flag::Ok);
        let tight = evaluate("QYLD", &obs, Thresholds::new(-0.05, -0.10), d(2024, 3, 1)).unwrap();
        assert_eq!(tight.flag, Flag::Warning);
    }
}
