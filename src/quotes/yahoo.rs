//! Yahoo Finance chart API source.
//!
//! One chart request per symbol returns both `meta.regularMarketPrice` and
//! the recent daily closes.

use super::{DailyClose, PriceSnapshot, PriceSource};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;

const BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

fn create_client() -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
}

fn symbol_url(symbol: &str) -> String {
    let encoded = urlencoding::encode(symbol);
    format!("{}/{}", BASE_URL, encoded)
}

pub struct YahooSource {
    client: reqwest::Client,
    history_days: u32,
}

impl YahooSource {
    pub fn new(history_days: u32) -> Result<Self> {
        Ok(Self {
            client: create_client()?,
            history_days: history_days.max(1),
        })
    }

    async fn fetch_symbol(&self, symbol: &str) -> Result<PriceSnapshot> {
        let url = format!(
            "{}?interval=1d&range={}d",
            symbol_url(symbol),
            self.history_days
        );
        log::debug!("Fetching Yahoo chart for {} from {}", symbol, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow!("Request failed for {}: {}", symbol, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            // Rate limited: the rest of the batch would fail the same way
            bail!("rate limited by Yahoo while fetching {}", symbol);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Yahoo API error for {}: {} - {}", symbol, status, body);
            return Ok(PriceSnapshot::unavailable(symbol));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse JSON for {}: {}", symbol, e))?;

        match parse_chart(symbol, &data) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                log::warn!("Unusable Yahoo response for {}: {}", symbol, e);
                Ok(PriceSnapshot::unavailable(symbol))
            }
        }
    }
}

#[async_trait]
impl PriceSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo"
    }

    async fn fetch_batch(&self, symbols: &[String]) -> Result<Vec<PriceSnapshot>> {
        let mut snapshots = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            snapshots.push(self.fetch_symbol(symbol).await?);
        }
        Ok(snapshots)
    }
}

/// Turn a chart response into a snapshot. Null closes (halted days) are
/// skipped.
pub fn parse_chart(symbol: &str, data: &serde_json::Value) -> Result<PriceSnapshot> {
    if let Some(error) = data.get("chart").and_then(|c| c.get("error")).and_then(|e| e.as_object()) {
        let code = error.get("code").and_then(|c| c.as_str()).unwrap_or("unknown");
        let desc = error.get("description").and_then(|d| d.as_str()).unwrap_or("No description");
        bail!("Yahoo API error for {}: {} - {}", symbol, code, desc);
    }

    let chart = data
        .get("chart")
        .and_then(|c| c.get("result"))
        .and_then(|r| r.get(0))
        .ok_or_else(|| anyhow!("Invalid response format"))?;

    let current_price = chart
        .get("meta")
        .and_then(|m| m.get("regularMarketPrice"))
        .and_then(|p| p.as_f64());

    let timestamps = chart
        .get("timestamp")
        .and_then(|t| t.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    let closes = chart
        .get("indicators")
        .and_then(|i| i.get("quote"))
        .and_then(|q| q.get(0))
        .and_then(|q| q.get("close"))
        .and_then(|c| c.as_array());

    let mut daily = Vec::new();
    if let Some(closes) = closes {
        for (i, ts) in timestamps.iter().enumerate() {
            let date = match ts.as_i64().and_then(|t| chrono::DateTime::from_timestamp(t, 0)) {
                Some(dt) => dt.date_naive(),
                None => continue,
            };
            if let Some(close) = closes.get(i).and_then(|v| v.as_f64()) {
                daily.push(DailyClose { date, close });
            }
        }
    }

    if current_price.is_none() && daily.is_empty() {
        bail!("No price data for {}", symbol);
    }

    Ok(PriceSnapshot {
        symbol: symbol.to_string(),
        current_price: current_price.or_else(|| daily.last().map(|c| c.close)),
        closes: daily,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chart() {
        let data = json!({
            "chart": {
                "result": [{
                    "meta": { "symbol": "AAPL", "regularMarketPrice": 190.5 },
                    "timestamp": [1719792000, 1719878400, 1719964800],
                    "indicators": { "quote": [{ "close": [180.0, null, 185.25] }] }
                }],
                "error": null
            }
        });
        let snap = parse_chart("AAPL", &data).unwrap();
        assert_eq!(snap.current_price, Some(190.5));
        assert_eq!(snap.closes.len(), 2);
        assert_eq!(snap.closes[1].close, 185.25);
        assert!(snap.closes[0].date < snap.closes[1].date);
    }

    #[test]
    fn test_parse_chart_falls_back_to_last_close() {
        let data = json!({
            "chart": {
                "result": [{
                    "meta": {},
                    "timestamp": [1719792000],
                    "indicators": { "quote": [{ "close": [42.0] }] }
                }]
            }
        });
        assert_eq!(parse_chart("X", &data).unwrap().current_price, Some(42.0));
    }

    #[test]
    fn test_parse_chart_error() {
        let data = json!({
            "chart": {
                "result": null,
                "error": { "code": "Not Found", "description": "No data found, symbol may be delisted" }
            }
        });
        assert!(parse_chart("NOPE", &data).is_err());
    }

    #[test]
    fn test_symbol_url_is_encoded() {
        assert!(symbol_url("^GSPC").ends_with("/%5EGSPC"));
        assert!(symbol_url("BRK.B").ends_with("/BRK.B"));
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_fetch_apple_snapshot() {
        let source = YahooSource::new(10).unwrap();
        let snaps = source.fetch_batch(&["AAPL".to_string()]).await.unwrap();
        assert!(snaps[0].current_price.is_some());
    }
}
