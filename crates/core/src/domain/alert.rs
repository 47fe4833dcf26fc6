use crate::domain::etf::TrackedEtf;
use crate::metrics::{Flag, MetricsSnapshot};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub etf_id: Uuid,
    pub ticker: String,
    pub name: String,
    pub flag: Flag,
    pub nav_erosion_pct: f64,
}

/// Every ETF whose latest snapshot is flagged WARNING or SELL. SELL comes before WARNING;
/// within a flag the most eroded ETF comes first.
pub fn collect_alerts<'a, I>(latest: I) -> Vec<Alert>
where
    I: IntoIterator<Item = (&'a TrackedEtf, Option<&'a MetricsSnapshot>)>,
{
    let mut out: Vec<Alert> = latest
        .into_iter()
        .filter_map(|(etf, snapshot)| {
            let snapshot = snapshot?;
            (snapshot.flag != Flag::Ok).then(|| Alert {
                etf_id: etf.id,
                ticker: etf.ticker.clone(),
                name: etf.name.clone(),
                flag: snapshot.flag,
                nav_erosion_pct: snapshot.nav_erosion_pct,
            })
        })
        .collect();

    out.sort_by(|a, b| {
        b.flag
            .cmp(&a.flag)
            .then_with(|| {
                a.nav_erosion_pct
                    .partial_cmp(&b.nav_erosion_pct)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    out
}
