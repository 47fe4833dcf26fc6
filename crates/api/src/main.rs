use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use navwatch_core::config::Settings;
use navwatch_core::domain::alert::{collect_alerts, Alert};
use navwatch_core::domain::contract::{validate_observations, RawObservation};
use navwatch_core::domain::etf::{normalize_ticker, ThresholdOverride, TrackedEtf};
use navwatch_core::ingest::provider::{MarketDataClient, YahooChartClient};
use navwatch_core::metrics::{
    compute_annualized_distribution_yield, generate_monthly_breakdown, MetricsSnapshot,
    MetricsSummary, MonthlyBreakdownRow, Observation, Thresholds,
};
use navwatch_core::refresh::{self, RefreshContext, RefreshOutcome, RefreshSummary};
use navwatch_core::storage;

mod export;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let client: Arc<dyn MarketDataClient> = Arc::new(YahooChartClient::from_settings(&settings)?);

    let state = AppState {
        pool,
        client,
        settings: Arc::new(settings),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/etfs", get(dashboard).post(add_etf))
        .route("/etfs/:etf_id", get(etf_detail).delete(delete_etf))
        .route("/etfs/:etf_id/metrics", get(etf_latest_metrics))
        .route(
            "/etfs/:etf_id/observations",
            get(list_etf_observations).post(record_observations),
        )
        .route("/etfs/:etf_id/deactivate", post(deactivate_etf))
        .route("/etfs/:etf_id/refresh", post(refresh_one))
        .route("/etfs/:etf_id/thresholds", put(update_thresholds))
        .route("/refresh", post(refresh_all))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/settings/:key", get(get_setting))
        .route("/export.csv", get(export_csv))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5001);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    pool: Option<PgPool>,
    client: Arc<dyn MarketDataClient>,
    settings: Arc<Settings>,
}

impl AppState {
    fn pool(&self) -> Result<&PgPool, StatusCode> {
        self.pool.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }

    async fn default_thresholds(&self, pool: &PgPool) -> Result<Thresholds, StatusCode> {
        storage::settings::resolve_default_thresholds(pool, self.settings.fallback_thresholds())
            .await
            .map_err(internal)
    }

    async fn refresh_context(&self, pool: &PgPool) -> Result<RefreshContext, StatusCode> {
        let now = Utc::now();
        let window = navwatch_core::time::window::history_window(self.settings.history_months, now)
            .map_err(internal)?;
        Ok(RefreshContext {
            window,
            calc_date: now.date_naive(),
            default_thresholds: self.default_thresholds(pool).await?,
        })
    }
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %format!("{e:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn load_etf(pool: &PgPool, etf_id: Uuid) -> Result<TrackedEtf, StatusCode> {
    storage::etfs::get_etf(pool, etf_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
struct DashboardRow {
    etf: TrackedEtf,
    thresholds: Thresholds,
    metrics: Option<MetricsSnapshot>,
    summary: Option<MetricsSummary>,
}

#[derive(Debug, Serialize)]
struct Dashboard {
    etfs: Vec<DashboardRow>,
    alerts: Vec<Alert>,
}

async fn dashboard(State(state): State<AppState>) -> Result<Json<Dashboard>, StatusCode> {
    let pool = state.pool()?;
    let defaults = state.default_thresholds(pool).await?;
    let latest = storage::snapshots::latest_for_active_etfs(pool)
        .await
        .map_err(internal)?;

    let alerts = collect_alerts(latest.iter().map(|(etf, m)| (etf, m.as_ref())));
    let etfs = latest
        .into_iter()
        .map(|(etf, metrics)| DashboardRow {
            thresholds: etf.thresholds.resolve(defaults),
            summary: metrics.as_ref().map(MetricsSnapshot::summary),
            etf,
            metrics,
        })
        .collect();

    Ok(Json(Dashboard { etfs, alerts }))
}

#[derive(Debug, Deserialize)]
struct AddEtfRequest {
    ticker: String,
    name: Option<String>,
    #[serde(default)]
    warn_threshold: Option<f64>,
    #[serde(default)]
    sell_threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AddEtfResponse {
    etf: TrackedEtf,
    refresh: Option<RefreshOutcome>,
    refresh_error: Option<String>,
}

async fn add_etf(
    State(state): State<AppState>,
    Json(req): Json<AddEtfRequest>,
) -> Result<(StatusCode, Json<AddEtfResponse>), StatusCode> {
    let pool = state.pool()?;
    let ticker = normalize_ticker(&req.ticker).map_err(|_| StatusCode::BAD_REQUEST)?;
    let thresholds = ThresholdOverride {
        warn_threshold: req.warn_threshold,
        sell_threshold: req.sell_threshold,
    };
    thresholds.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let profile = state.client.fetch_profile(&ticker).await.map_err(|e| {
        tracing::warn!(%ticker, error = %format!("{e:#}"), "ticker validation failed");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let name = req
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or(profile.name);

    let Some(etf) =
        storage::etfs::add_etf(pool, &name, &ticker, thresholds, Utc::now().date_naive())
            .await
            .map_err(internal)?
    else {
        let existing = storage::etfs::get_etf_by_ticker(pool, &ticker)
            .await
            .map_err(internal)?;
        tracing::info!(
            %ticker,
            etf_id = ?existing.as_ref().map(|e| e.id),
            active = ?existing.as_ref().map(|e| e.active),
            "ticker is already tracked"
        );
        return Err(StatusCode::CONFLICT);
    };

    tracing::info!(ticker = %etf.ticker, etf_id = %etf.id, "tracking new ETF");

    let ctx = state.refresh_context(pool).await?;
    let (refresh, refresh_error) =
        match refresh::refresh_etf(pool, state.client.as_ref(), &etf, ctx).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                (None, Some(format!("{e:#}")))
            }
        };

    Ok((
        StatusCode::CREATED,
        Json(AddEtfResponse {
            etf,
            refresh,
            refresh_error,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct DetailQuery {
    history_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EtfDetail {
    etf: TrackedEtf,
    thresholds: Thresholds,
    metrics: Option<MetricsSnapshot>,
    summary: Option<MetricsSummary>,
    history: Vec<MetricsSnapshot>,
    breakdown: Vec<MonthlyBreakdownRow>,
    annualized_distribution_yield: f64,
}

async fn etf_detail(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
    Query(q): Query<DetailQuery>,
) -> Result<Json<EtfDetail>, StatusCode> {
    let pool = state.pool()?;
    let etf = load_etf(pool, etf_id).await?;
    let defaults = state.default_thresholds(pool).await?;

    let limit = q
        .history_limit
        .unwrap_or(storage::snapshots::DEFAULT_HISTORY_LIMIT);
    if limit < 1 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let metrics = storage::snapshots::latest_snapshot(pool, etf_id)
        .await
        .map_err(internal)?;
    let history = storage::snapshots::snapshot_history(pool, etf_id, limit)
        .await
        .map_err(internal)?;
    let observations = storage::observations::list_observations(pool, etf_id, None)
        .await
        .map_err(internal)?;

    Ok(Json(EtfDetail {
        thresholds: etf.thresholds.resolve(defaults),
        summary: metrics.as_ref().map(MetricsSnapshot::summary),
        breakdown: generate_monthly_breakdown(&observations),
        annualized_distribution_yield: compute_annualized_distribution_yield(&observations),
        etf,
        metrics,
        history,
    }))
}

#[derive(Debug, Serialize)]
struct LatestMetrics {
    etf: TrackedEtf,
    metrics: Option<MetricsSnapshot>,
}

async fn etf_latest_metrics(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
) -> Result<Json<LatestMetrics>, StatusCode> {
    let pool = state.pool()?;
    let etf = load_etf(pool, etf_id).await?;
    let metrics = storage::snapshots::latest_snapshot(pool, etf_id)
        .await
        .map_err(internal)?;
    Ok(Json(LatestMetrics { etf, metrics }))
}

#[derive(Debug, Deserialize)]
struct ObservationQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    limit: Option<i64>,
}

async fn list_etf_observations(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
    Query(q): Query<ObservationQuery>,
) -> Result<Json<Vec<Observation>>, StatusCode> {
    let pool = state.pool()?;
    load_etf(pool, etf_id).await?;

    let observations = match (q.start, q.end) {
        (Some(start), Some(end)) if start <= end => {
            storage::observations::list_observations_range(pool, etf_id, start, end).await
        }
        (None, None) => {
            if q.limit.is_some_and(|l| l < 1) {
                return Err(StatusCode::BAD_REQUEST);
            }
            storage::observations::list_observations(pool, etf_id, q.limit).await
        }
        _ => return Err(StatusCode::BAD_REQUEST),
    }
    .map_err(internal)?;

    Ok(Json(observations))
}

async fn record_observations(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
    Json(raw): Json<Vec<RawObservation>>,
) -> Result<Json<RefreshOutcome>, StatusCode> {
    let pool = state.pool()?;
    let etf = load_etf(pool, etf_id).await?;

    let observations = validate_observations(raw).map_err(|e| {
        tracing::warn!(ticker = %etf.ticker, error = %format!("{e:#}"), "rejected observations");
        StatusCode::BAD_REQUEST
    })?;
    if observations.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let defaults = state.default_thresholds(pool).await?;
    refresh::record_observations(pool, &etf, &observations, defaults, Utc::now().date_naive())
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::CONFLICT)
}

async fn delete_etf(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let pool = state.pool()?;
    if storage::etfs::delete_etf(pool, etf_id).await.map_err(internal)? {
        tracing::info!(%etf_id, "deleted ETF");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn deactivate_etf(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let pool = state.pool()?;
    if storage::etfs::deactivate_etf(pool, etf_id)
        .await
        .map_err(internal)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn refresh_one(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
) -> Result<Json<RefreshOutcome>, StatusCode> {
    let pool = state.pool()?;
    let etf = load_etf(pool, etf_id).await?;
    let ctx = state.refresh_context(pool).await?;

    match refresh::refresh_etf(pool, state.client.as_ref(), &etf, ctx).await {
        Ok(Some(outcome)) => Ok(Json(outcome)),
        Ok(None) => Err(StatusCode::CONFLICT),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(ticker = %etf.ticker, error = %format!("{e:#}"), "refresh failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn refresh_all(State(state): State<AppState>) -> Result<Json<RefreshSummary>, StatusCode> {
    let pool = state.pool()?;
    let ctx = state.refresh_context(pool).await?;
    let summary = refresh::refresh_all(pool, state.client.as_ref(), ctx)
        .await
        .map_err(internal)?;
    Ok(Json(summary))
}

async fn update_thresholds(
    State(state): State<AppState>,
    Path(etf_id): Path<Uuid>,
    Json(thresholds): Json<ThresholdOverride>,
) -> Result<StatusCode, StatusCode> {
    let pool = state.pool()?;
    thresholds.validate().map_err(|_| StatusCode::BAD_REQUEST)?;
    if storage::etfs::update_thresholds(pool, etf_id, thresholds)
        .await
        .map_err(internal)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Serialize)]
struct SettingsView {
    default_thresholds: Thresholds,
    values: BTreeMap<String, String>,
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<SettingsView>, StatusCode> {
    let pool = state.pool()?;
    let values = storage::settings::all_settings(pool)
        .await
        .map_err(internal)?;
    let default_thresholds = storage::settings::thresholds_from_settings(
        &values,
        state.settings.fallback_thresholds(),
    );
    Ok(Json(SettingsView {
        default_thresholds,
        values,
    }))
}

#[derive(Debug, Serialize)]
struct SettingValue {
    key: String,
    value: String,
}

async fn get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, StatusCode> {
    let pool = state.pool()?;
    let value = storage::settings::get_setting(pool, &key)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(SettingValue { key, value }))
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    default_thresholds: Option<Thresholds>,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

async fn put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<StatusCode, StatusCode> {
    let pool = state.pool()?;

    if let Some(t) = update.default_thresholds {
        if !(t.warn_threshold.is_finite() && t.sell_threshold.is_finite()) {
            return Err(StatusCode::BAD_REQUEST);
        }
        storage::settings::set_default_thresholds(pool, t)
            .await
            .map_err(internal)?;
    }

    for (key, value) in &update.values {
        if key.trim().is_empty() {
            return Err(StatusCode::BAD_REQUEST);
        }
        storage::settings::set_setting(pool, key, value)
            .await
            .map_err(internal)?;
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn export_csv(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let pool = state.pool()?;
    let latest = storage::snapshots::latest_for_active_etfs(pool)
        .await
        .map_err(internal)?;

    let mut rows = Vec::with_capacity(latest.len());
    for (etf, metrics) in latest {
        let observations = storage::observations::list_observations(pool, etf.id, None)
            .await
            .map_err(internal)?;
        rows.push(export::EtfExport {
            etf,
            observations,
            metrics,
        });
    }

    let body = export::render_csv(&rows).map_err(internal)?;
    let disposition = format!(
        "attachment;filename={}",
        export::export_filename(Utc::now().date_naive())
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
