pub mod domain;
pub mod ingest;
pub mod metrics;
pub mod refresh;
pub mod storage;
pub mod time;

pub mod config {
    use crate::metrics::Thresholds;
    use anyhow::Context;

    pub const DEFAULT_MARKET_DATA_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_MARKET_DATA_RETRIES: u32 = 3;
    pub const DEFAULT_HISTORY_MONTHS: u32 = 12;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub market_data_base_url: Option<String>,
        pub market_data_timeout_secs: u64,
        pub market_data_retries: u32,
        /// Env fallback for the global thresholds when the settings table has none.
        pub default_warn_threshold: Option<f64>,
        pub default_sell_threshold: Option<f64>,
        pub history_months: u32,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                database_url: None,
                sentry_dsn: None,
                market_data_base_url: None,
                market_data_timeout_secs: DEFAULT_MARKET_DATA_TIMEOUT_SECS,
                market_data_retries: DEFAULT_MARKET_DATA_RETRIES,
                default_warn_threshold: None,
                default_sell_threshold: None,
                history_months: DEFAULT_HISTORY_MONTHS,
            }
        }
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                market_data_base_url: std::env::var("MARKET_DATA_BASE_URL")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                market_data_timeout_secs: parse_env("MARKET_DATA_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_MARKET_DATA_TIMEOUT_SECS),
                market_data_retries: parse_env("MARKET_DATA_RETRIES")?
                    .unwrap_or(DEFAULT_MARKET_DATA_RETRIES),
                default_warn_threshold: parse_env("DEFAULT_WARN_THRESHOLD")?,
                default_sell_threshold: parse_env("DEFAULT_SELL_THRESHOLD")?,
                history_months: parse_env("HISTORY_MONTHS")?.unwrap_or(DEFAULT_HISTORY_MONTHS),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        /// Env-level default thresholds, falling back to the built-in pair.
        pub fn fallback_thresholds(&self) -> Thresholds {
            Thresholds {
                warn_threshold: self
                    .default_warn_threshold
                    .unwrap_or(Thresholds::DEFAULT.warn_threshold),
                sell_threshold: self
                    .default_sell_threshold
                    .unwrap_or(Thresholds::DEFAULT.sell_threshold),
            }
        }
    }

    fn parse_env<T>(key: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match std::env::var(key) {
            Ok(s) if !s.trim().is_empty() => s
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid {key}={s:?}: {e}")),
            _ => Ok(None),
        }
    }

}
