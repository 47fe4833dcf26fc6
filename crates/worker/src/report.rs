use navwatch_core::domain::alert::Alert;
use navwatch_core::metrics::{
    compute_annualized_distribution_yield, format_pct, generate_monthly_breakdown,
};
use navwatch_core::refresh::{Preview, RefreshSummary};

pub fn log_preview(preview: &Preview) {
    for row in generate_monthly_breakdown(&preview.observations) {
        tracing::info!(
            ticker = %preview.ticker,
            month = %row.month,
            close_price = row.close_price,
            distribution = row.distribution,
            cumulative_erosion = %format_pct(row.cumulative_erosion_pct),
            "monthly breakdown"
        );
    }

    let yield_pct = format_pct(compute_annualized_distribution_yield(&preview.observations));
    match &preview.snapshot {
        Some(snapshot) => {
            let summary = snapshot.summary();
            tracing::info!(
                ticker = %preview.ticker,
                dry_run = true,
                window_start = %snapshot.window_start,
                window_end = %snapshot.window_end,
                nav_erosion = %summary.nav_erosion,
                true_return = %summary.true_return,
                total_distributions = %summary.total_distributions,
                distribution_yield = %yield_pct,
                flag = %summary.flag,
                "metrics preview"
            );
        }
        None => tracing::info!(
            ticker = %preview.ticker,
            dry_run = true,
            observations = preview.observations.len(),
            "not enough monthly data for metrics"
        ),
    }
}

pub fn log_summary(summary: &RefreshSummary, alerts: &[Alert]) {
    for alert in alerts {
        tracing::warn!(
            ticker = %alert.ticker,
            name = %alert.name,
            flag = %alert.flag,
            nav_erosion = %format_pct(alert.nav_erosion_pct),
            "NAV erosion alert"
        );
    }

    tracing::info!(
        refreshed = summary.refreshed.len(),
        skipped = summary.skipped.len(),
        failures = summary.failures.len(),
        alerts = alerts.len(),
        "refresh run complete"
    );
}
