use anyhow::Context;
use clap::Parser;
use navwatch_core::config::Settings;
use navwatch_core::domain::alert::collect_alerts;
use navwatch_core::domain::etf::normalize_ticker;
use navwatch_core::ingest::provider::YahooChartClient;
use navwatch_core::refresh::{self, RefreshContext, RefreshSummary};
use navwatch_core::time::window::{history_window, resolve_calc_date};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod report;

#[derive(Debug, Parser)]
#[command(name = "navwatch_worker")]
struct Args {
    /// Only refresh these tickers (repeatable). Defaults to every active tracked ETF.
    #[arg(long = "ticker")]
    tickers: Vec<String>,

    /// Months of history to fetch. Overrides HISTORY_MONTHS.
    #[arg(long)]
    months: Option<u32>,

    /// Evaluation date stamped on snapshots (YYYY-MM-DD). Defaults to today's UTC date.
    #[arg(long)]
    calc_date: Option<String>,

    /// Fetch and compute for the given tickers without touching the database.
    #[arg(long)]
    dry_run: bool,
}

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

    let args = Args::parse();

    let now = chrono::Utc::now();
    let calc_date = resolve_calc_date(args.calc_date.as_deref(), now)?;
    let window = history_window(args.months.unwrap_or(settings.history_months), now)?;
    let tickers = args
        .tickers
        .iter()
        .map(|t| normalize_ticker(t))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let client = YahooChartClient::from_settings(&settings)?;

    if args.dry_run {
        anyhow::ensure!(!tickers.is_empty(), "--dry-run needs at least one --ticker");
        let thresholds = settings.fallback_thresholds();
        for ticker in &tickers {
            match refresh::compute_preview(&client, ticker, thresholds, window, calc_date).await {
                Ok(preview) => report::log_preview(&preview),
                Err(err) => {
                    tracing::error!(%ticker, error = %format!("{err:#}"), "dry-run fetch failed");
                    sentry_anyhow::capture_anyhow(&err);
                }
            }
        }
        return Ok(());
    }

    let db_url = settings.require_database_url()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    navwatch_core::storage::migrate(&pool).await?;

    let default_thresholds = navwatch_core::storage::settings::resolve_default_thresholds(
        &pool,
        settings.fallback_thresholds(),
    )
    .await?;

    let ctx = RefreshContext {
        window,
        calc_date,
        default_thresholds,
    };

    let etfs = if tickers.is_empty() {
        navwatch_core::storage::etfs::list_etfs(&pool, true).await?
    } else {
        let mut selected = Vec::with_capacity(tickers.len());
        for ticker in &tickers {
            match navwatch_core::storage::etfs::get_etf_by_ticker(&pool, ticker).await? {
                Some(etf) if etf.active => selected.push(etf),
                Some(_) => tracing::warn!(%ticker, "ETF is deactivated; skipping"),
                None => tracing::warn!(%ticker, "ticker is not tracked; skipping"),
            }
        }
        selected
    };

    tracing::info!(
        %calc_date,
        window_start = %window.start,
        window_end = %window.end,
        etfs = etfs.len(),
        "starting refresh run"
    );

    let summary: RefreshSummary = refresh::refresh_many(&pool, &client, &etfs, ctx).await;

    let alerts = collect_alerts(summary.refreshed.iter().filter_map(|outcome| {
        let etf = etfs.iter().find(|e| e.id == outcome.etf_id)?;
        Some((etf, outcome.snapshot.as_ref()))
    }));
    report::log_summary(&summary, &alerts);

    for failure in &summary.failures {
        sentry::capture_message(
            &format!("refresh failed for {}: {}", failure.ticker, failure.error),
            sentry::Level::Error,
        );
    }

    anyhow::ensure!(
        summary.failures.is_empty(),
        "{} of {} ETF refreshes failed",
        summary.failures.len(),
        etfs.len()
    );
    Ok(())
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
