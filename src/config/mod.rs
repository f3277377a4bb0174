//! Runtime configuration.
//!
//! Resolution order: defaults, then `<data dir>/lot-tracker/settings.json`
//! (camelCase JSON, every field optional), then `LOT_TRACKER_*` environment
//! variables.

use crate::cash::IncomePolicy;
use crate::commands::assets::TargetDeletePolicy;
use crate::error::{LedgerError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "lot-tracker";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub database_path: PathBuf,
    pub quote_batch_size: usize,
    pub quote_concurrency: usize,
    pub quote_batch_delay_ms: u64,
    pub quote_timeout_secs: u64,
    pub price_cache_ttl_secs: i64,
    /// Daily closes requested per symbol
    pub history_days: u32,
    pub dip_lookback_days: i64,
    pub income_policy: IncomePolicy,
    pub target_delete_policy: TargetDeletePolicy,
    /// Compare the post-mutation replay with the stored wallets
    pub verify_after_mutation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: app_data_dir().join("ledger.db"),
            quote_batch_size: 10,
            quote_concurrency: 1,
            quote_batch_delay_ms: 250,
            quote_timeout_secs: 15,
            price_cache_ttl_secs: 900,
            history_days: 30,
            dip_lookback_days: 5,
            income_policy: IncomePolicy::default(),
            target_delete_policy: TargetDeletePolicy::default(),
            verify_after_mutation: true,
        }
    }
}

/// `<data dir>/lot-tracker`, or the working directory when the platform has
/// no data dir.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn settings_path() -> PathBuf {
    app_data_dir().join(SETTINGS_FILE)
}

impl Config {
    /// Defaults, settings file and environment, validated.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::from_file(&settings_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the settings file, if it exists.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file {:?}", path))?;
        log::info!("Loaded settings from {:?}", path);
        Ok(config)
    }

    /// Apply `LOT_TRACKER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LOT_TRACKER_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(v) = lookup("LOT_TRACKER_BATCH_SIZE") {
            self.quote_batch_size = v
                .parse()
                .with_context(|| format!("LOT_TRACKER_BATCH_SIZE is not a number: {}", v))?;
        }
        if let Some(v) = lookup("LOT_TRACKER_FETCH_TIMEOUT_SECS") {
            self.quote_timeout_secs = v
                .parse()
                .with_context(|| format!("LOT_TRACKER_FETCH_TIMEOUT_SECS is not a number: {}", v))?;
        }
        if let Some(v) = lookup("LOT_TRACKER_CACHE_TTL_SECS") {
            self.price_cache_ttl_secs = v
                .parse()
                .with_context(|| format!("LOT_TRACKER_CACHE_TTL_SECS is not a number: {}", v))?;
        }
        if let Some(v) = lookup("LOT_TRACKER_INCOME_POLICY") {
            self.income_policy = IncomePolicy::from_str(&v)
                .ok_or_else(|| anyhow::anyhow!("Unknown LOT_TRACKER_INCOME_POLICY: {}", v))?;
        }
        if let Some(v) = lookup("LOT_TRACKER_TARGET_DELETE_POLICY") {
            self.target_delete_policy = TargetDeletePolicy::from_str(&v)
                .ok_or_else(|| anyhow::anyhow!("Unknown LOT_TRACKER_TARGET_DELETE_POLICY: {}", v))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quote_batch_size == 0 {
            return Err(LedgerError::validation("quoteBatchSize must be at least 1"));
        }
        if self.quote_concurrency == 0 {
            return Err(LedgerError::validation("quoteConcurrency must be at least 1"));
        }
        if self.quote_timeout_secs == 0 {
            return Err(LedgerError::validation("quoteTimeoutSecs must be at least 1"));
        }
        if self.dip_lookback_days < 0 {
            return Err(LedgerError::validation(format!(
                "dipLookbackDays must not be negative, got {}",
                self.dip_lookback_days
            )));
        }
        Ok(())
    }

    pub fn dip_lookback(&self) -> u32 {
        self.dip_lookback_days.clamp(0, u32::MAX as i64) as u32
    }
}
