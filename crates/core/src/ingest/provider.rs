use crate::config::Settings;
use crate::ingest::types::{EtfProfile, PriceHistory};
use crate::ingest::yahoo::ChartResponse;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const CHART_PATH: &str = "/v8/finance/chart";
const USER_AGENT_VALUE: &str = "Mozilla/5.0 (compatible; navwatch/0.1)";

#[async_trait::async_trait]
pub trait MarketDataClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Daily closes and distribution events in `[start, end]`, plus the raw provider payload.
    async fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(PriceHistory, Value)>;

    async fn fetch_profile(&self, ticker: &str) -> Result<EtfProfile>;
}

#[derive(Debug, Clone)]
pub struct YahooChartClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
}

impl YahooChartClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings
            .market_data_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.market_data_timeout_secs))
            .default_headers(headers)
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url,
            retries: settings.market_data_retries.max(1),
        })
    }

    fn chart_url(&self, ticker: &str) -> String {
        format!(
            "{}{}/{}",
            self.base_url.trim_end_matches('/'),
            CHART_PATH,
            ticker
        )
    }

    async fn fetch_once(
        &self,
        ticker: &str,
        query: &[(&str, String)],
    ) -> Result<(ChartResponse, Value)> {
        let res = self
            .http
            .get(self.chart_url(ticker))
            .query(query)
            .send()
            .await
            .context("market data request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read market data response")?;
        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("market data response is not valid JSON: {text}"))?;

        // 404 carries a chart.error body naming the problem; let the parser surface it.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            anyhow::bail!("market data HTTP {status}: {raw_json}");
        }

        let parsed = serde_json::from_value::<ChartResponse>(raw_json.clone())
            .context("failed to parse market data response into ChartResponse")?;
        Ok((parsed, raw_json))
    }

    async fn fetch_with_retry(
        &self,
        ticker: &str,
        query: &[(&str, String)],
    ) -> Result<(ChartResponse, Value)> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(ticker, query).await {
                Ok(ok) => return Ok(ok),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        ?backoff,
                        %ticker,
                        error = %err,
                        "market data fetch failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl MarketDataClient for YahooChartClient {
    fn provider_name(&self) -> &'static str {
        "yahoo_chart"
    }

    async fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<(PriceHistory, Value)> {
        anyhow::ensure!(start <= end, "history window is empty: {start}..{end}");

        let query = history_query(start, end);
        let (parsed, raw) = self.fetch_with_retry(ticker, &query).await?;
        let history = parsed
            .into_history()
            .with_context(|| format!("no price history for {ticker}"))?;

        anyhow::ensure!(!history.bars.is_empty(), "No data found for ticker {ticker}");

        tracing::debug!(
            %ticker,
            %start,
            %end,
            bars = history.bars.len(),
            distributions = history.distributions.len(),
            "fetched price history"
        );
        Ok((history, raw))
    }

    async fn fetch_profile(&self, ticker: &str) -> Result<EtfProfile> {
        let query = [
            ("range", "5d".to_string()),
            ("interval", "1d".to_string()),
        ];
        let (parsed, _) = self.fetch_with_retry(ticker, &query).await?;
        parsed
            .into_profile()
            .with_context(|| format!("Invalid ticker: {ticker}"))
    }
}

fn history_query(start: NaiveDate, end: NaiveDate) -> Vec<(&'static str, String)> {
    // period2 is exclusive upstream; push it to the following midnight so `end` is included.
    let period1 = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
    let period2 = (end + ChronoDuration::days(1))
        .and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .timestamp();

    vec![
        ("period1", period1.to_string()),
        ("period2", period2.to_string()),
        ("interval", "1d".to_string()),
        ("events", "div".to_string()),
        ("includeAdjustedClose", "false".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: Option<&str>) -> Settings {
        Settings {
            market_data_base_url: base_url.map(str::to_string),
            ..Settings::default()
        }
    }

    #[test]
    fn chart_url_joins_base_and_ticker() {
        let client =
            YahooChartClient::from_settings(&settings(Some("http://localhost:9000/"))).unwrap();
        assert_eq!(
            client.chart_url("JEPI"),
            "http://localhost:9000/v8/finance/chart/JEPI"
        );

        let client = YahooChartClient::from_settings(&settings(None)).unwrap();
        assert_eq!(
            client.chart_url("HMAX.TO"),
            "https://query1.finance.yahoo.com/v8/finance/chart/HMAX.TO"
        );
    }

    #[test]
    fn history_query_covers_end_date() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let q = history_query(start, end);
        assert_eq!(q[0], ("period1", "1704067200".to_string()));
        assert_eq!(q[1], ("period2", "1706745600".to_string()));
        assert!(q.contains(&("events", "div".to_string())));
    }
}
