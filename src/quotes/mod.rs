//! Price snapshots: the current price plus recent daily closes per symbol.
//!
//! - `PriceSource`: pluggable fetcher, one batch of symbols per call
//! - `refresh_prices`: batched, rate-limited refresh that always completes
//! - `cache::PriceCache`: injectable TTL cache in front of a source
//! - `yahoo::YahooSource`: Yahoo Finance chart API

pub mod cache;
pub mod yahoo;

use crate::config::Config;
use crate::error::LedgerError;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyClose {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub symbol: String,
    /// None when the source had no price for the symbol
    pub current_price: Option<f64>,
    pub closes: Vec<DailyClose>,
}

impl PriceSnapshot {
    pub fn unavailable(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            current_price: None,
            closes: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.current_price.is_some()
    }
}

/// A quote feed. Implementations may return fewer snapshots than symbols
/// asked for; missing symbols count as unavailable.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_batch(&self, symbols: &[String]) -> anyhow::Result<Vec<PriceSnapshot>>;
}

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
    /// Pause before each batch after the first wave
    pub batch_delay: Duration,
    /// Per-batch call timeout
    pub timeout: Duration,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 1,
            batch_delay: Duration::from_millis(250),
            timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for RefreshOptions {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.quote_batch_size,
            concurrency: config.quote_concurrency,
            batch_delay: Duration::from_millis(config.quote_batch_delay_ms),
            timeout: Duration::from_secs(config.quote_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub available: usize,
    pub unavailable: usize,
}

#[derive(Debug, Default)]
pub struct RefreshReport {
    /// One entry per requested symbol, unavailable ones included
    pub snapshots: HashMap<String, PriceSnapshot>,
    pub unavailable: Vec<String>,
    /// One `ExternalFetch` per failed batch
    pub errors: Vec<LedgerError>,
}

impl RefreshReport {
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.snapshots.get(symbol).and_then(|s| s.current_price)
    }

    pub fn available_count(&self) -> usize {
        self.snapshots.values().filter(|s| s.is_available()).count()
    }
}

/// Fetch snapshots for `symbols` in batches. A failed or timed-out batch
/// marks only its own symbols unavailable; the call itself never fails.
pub async fn refresh_prices<F>(
    source: &dyn PriceSource,
    symbols: &[String],
    options: &RefreshOptions,
    mut on_progress: F,
) -> RefreshReport
where
    F: FnMut(RefreshProgress),
{
    let mut seen = HashSet::new();
    let unique: Vec<String> = symbols
        .iter()
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect();
    let batches: Vec<Vec<String>> = unique
        .chunks(options.batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();
    let total_batches = batches.len();
    let concurrency = options.concurrency.max(1);
    let delay = options.batch_delay;
    let timeout = options.timeout;

    log::info!(
        "Refreshing {} symbols from {} in {} batches",
        unique.len(),
        source.name(),
        total_batches
    );

    let mut results = stream::iter(batches.into_iter().enumerate())
        .map(move |(index, batch)| async move {
            if index >= concurrency && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match tokio::time::timeout(timeout, source.fetch_batch(&batch)).await {
                Ok(Ok(snapshots)) => Ok(snapshots),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            };
            (batch, outcome)
        })
        .buffered(concurrency);

    let mut report = RefreshReport::default();
    let mut completed = 0;
    while let Some((batch, outcome)) = results.next().await {
        completed += 1;
        match outcome {
            Ok(snapshots) => {
                let mut by_symbol: HashMap<String, PriceSnapshot> = snapshots
                    .into_iter()
                    .map(|s| (s.symbol.clone(), s))
                    .collect();
                for symbol in &batch {
                    let snapshot = by_symbol
                        .remove(symbol)
                        .unwrap_or_else(|| PriceSnapshot::unavailable(symbol));
                    if !snapshot.is_available() {
                        report.unavailable.push(symbol.clone());
                    }
                    report.snapshots.insert(symbol.clone(), snapshot);
                }
            }
            Err(reason) => {
                log::warn!("Price batch {:?} failed: {}", batch, reason);
                for symbol in &batch {
                    report.unavailable.push(symbol.clone());
                    report
                        .snapshots
                        .insert(symbol.clone(), PriceSnapshot::unavailable(symbol));
                }
                report.errors.push(LedgerError::ExternalFetch {
                    symbols: batch,
                    reason,
                });
            }
        }

        on_progress(RefreshProgress {
            completed_batches: completed,
            total_batches,
            available: report.available_count(),
            unavailable: report.unavailable.len(),
        });
    }

    log::info!(
        "Price refresh finished: {} available, {} unavailable, {} failed batches",
        report.available_count(),
        report.unavailable.len(),
        report.errors.len()
    );
    report
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted source: symbols starting with "FAIL" break their batch,
    /// "SLOW" stalls it, "NONE" are silently missing.
    pub(crate) struct ScriptedSource {
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub(crate) fn new() -> Self {
            Self { calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_batch(&self, symbols: &[String]) -> anyhow::Result<Vec<PriceSnapshot>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if symbols.iter().any(|s| s.starts_with("FAIL")) {
                anyhow::bail!("HTTP error: 429 Too Many Requests");
            }
            if symbols.iter().any(|s| s.starts_with("SLOW")) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Ok(symbols
                .iter()
                .filter(|s| !s.starts_with("NONE"))
                .map(|s| PriceSnapshot {
                    symbol: s.clone(),
                    current_price: Some(s.len() as f64),
                    closes: vec![],
                })
                .collect())
        }
    }

    fn options(batch_size: usize) -> RefreshOptions {
        RefreshOptions {
            batch_size,
            concurrency: 1,
            batch_delay: Duration::ZERO,
            timeout: Duration::from_millis(100),
        }
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failed_batch_is_isolated() {
        let source = ScriptedSource::new();
        let mut progress = Vec::new();
        let report = refresh_prices(
            &source,
            &symbols(&["AA", "BB", "FAIL1", "CC", "DD"]),
            &options(2),
            |p| progress.push(p),
        )
        .await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.snapshots.len(), 5);
        assert_eq!(report.price("AA"), Some(2.0));
        assert_eq!(report.price("DD"), Some(2.0));
        assert!(report.price("FAIL1").is_none());
        assert!(report.price("CC").is_none(), "batch mate of a failure is unavailable");
        assert_eq!(report.unavailable, vec!["FAIL1".to_string(), "CC".to_string()]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], LedgerError::ExternalFetch { .. }));

        assert_eq!(progress.len(), 3);
        assert_eq!(progress[2].completed_batches, 3);
        assert_eq!(progress[2].available, 3);
    }

    #[tokio::test]
    async fn test_timeout_marks_batch_unavailable() {
        let source = ScriptedSource::new();
        let report = refresh_prices(&source, &symbols(&["SLOW", "AA"]), &options(1), |_| {}).await;
        assert!(report.price("SLOW").is_none());
        assert_eq!(report.price("AA"), Some(2.0));
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_symbol_is_unavailable() {
        let source = ScriptedSource::new();
        let report = refresh_prices(&source, &symbols(&["AA", "NONE", "AA"]), &options(10), |_| {}).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.snapshots.len(), 2);
        assert_eq!(report.unavailable, vec!["NONE".to_string()]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_empty_symbol_list() {
        let source = ScriptedSource::new();
        let mut calls = 0;
        let report = refresh_prices(&source, &[], &options(10), |_| calls += 1).await;
        assert!(report.snapshots.is_empty());
        assert_eq!(calls, 0);
    }
}
