use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use engine::ScanConfig;
use strategy::SignalConfig;
use tracker::TrackerConfig;

/// Contents of the scanner settings file.
///
/// ```toml
/// [signal]
/// rsi_oversold = 30.0
///
/// [tracker]
/// max_trades_per_symbol = 1
///
/// [scan]
/// interval_secs = 300
/// instruments = ["BTCUSDT", "ETHUSDT"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub signal: SignalConfig,
    pub tracker: TrackerConfig,
    pub scan: ScanConfig,
}

impl Settings {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!(path, "Scanner settings file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scanner settings at '{path}'"))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse scanner settings at '{path}'"))
    }

    /// Apply the environment overrides on top of the file values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "RSI_PERIOD", &mut self.signal.rsi_period)?;
        override_with(&lookup, "RSI_OVERBOUGHT", &mut self.signal.rsi_overbought)?;
        override_with(&lookup, "RSI_OVERSOLD", &mut self.signal.rsi_oversold)?;
        override_with(&lookup, "VOLUME_RATIO_MIN", &mut self.signal.volume_ratio_min)?;
        override_with(&lookup, "CONFIDENCE_THRESHOLD", &mut self.signal.confidence_threshold)?;
        override_with(&lookup, "MIN_RR_RATIO", &mut self.signal.min_rr_ratio)?;
        override_with(&lookup, "MAX_TRADES_PER_SYMBOL", &mut self.tracker.max_trades_per_symbol)?;
        override_with(&lookup, "SCAN_INTERVAL", &mut self.scan.interval_secs)?;
        override_with(&lookup, "SCAN_BATCH_SIZE", &mut self.scan.batch_size)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.signal.validate()?;
        self.tracker.validate()?;
        self.scan.validate()?;
        let expiry_secs = self.tracker.expiry_hours.saturating_mul(3600);
        if expiry_secs < i64::try_from(self.scan.interval_secs).unwrap_or(i64::MAX) {
            bail!(
                "expiry_hours ({}) is shorter than one scan interval ({}s)",
                self.tracker.expiry_hours,
                self.scan.interval_secs
            );
        }
        Ok(())
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{key} has an invalid value: '{raw}'"))?;
    Ok(())
}
