use serde::{Deserialize, Serialize};

use common::{Error, Result};

use crate::indicators::IndicatorParams;

/// How stop-loss and take-profit are placed around entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelMode {
    /// `entry ± ATR × risk_multiplier`, take-profit scaled by `min_rr_ratio`.
    #[default]
    Atr,
    /// Fixed fractional offsets from entry.
    Percent,
}

/// `[signal]` section of the scanner settings file.
///
/// ```toml
/// [signal]
/// rsi_period = 14
/// rsi_overbought = 65.0
/// rsi_oversold = 35.0
/// level_mode = "atr"
/// risk_multiplier = 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_period: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub volume_ratio_min: f64,
    pub confidence_threshold: f64,
    pub min_rr_ratio: f64,
    pub ma_short: usize,
    pub ma_long: usize,
    pub atr_period: usize,
    pub volume_window: usize,
    /// Require `price > MA_short > MA_long` (mirrored for SHORT).
    pub trend_filter: bool,
    pub level_mode: LevelMode,
    pub risk_multiplier: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_overbought: 65.0,
            rsi_oversold: 35.0,
            volume_ratio_min: 1.15,
            confidence_threshold: 65.0,
            min_rr_ratio: 2.0,
            ma_short: 20,
            ma_long: 50,
            atr_period: 14,
            volume_window: 20,
            trend_filter: false,
            level_mode: LevelMode::Atr,
            risk_multiplier: 2.0,
            take_profit_pct: 0.02,
            stop_loss_pct: 0.01,
        }
    }
}

impl SignalConfig {
    pub fn indicator_params(&self) -> IndicatorParams {
        IndicatorParams {
            rsi_period: self.rsi_period,
            ma_short: self.ma_short,
            ma_long: self.ma_long,
            atr_period: self.atr_period,
            volume_window: self.volume_window,
        }
    }

    /// Reject settings the generator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.rsi_period < 2 {
            return Err(Error::Config("rsi_period must be >= 2".into()));
        }
        if !(0.0..=100.0).contains(&self.rsi_oversold)
            || !(0.0..=100.0).contains(&self.rsi_overbought)
            || self.rsi_oversold >= self.rsi_overbought
        {
            return Err(Error::Config(format!(
                "RSI thresholds must satisfy 0 <= oversold < overbought <= 100, got {} / {}",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if self.ma_short == 0 || self.ma_short >= self.ma_long {
            return Err(Error::Config(format!(
                "ma_short ({}) must be non-zero and below ma_long ({})",
                self.ma_short, self.ma_long
            )));
        }
        if self.atr_period == 0 || self.volume_window < 2 {
            return Err(Error::Config(
                "atr_period must be >= 1 and volume_window >= 2".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold must be in [0, 100], got {}",
                self.confidence_threshold
            )));
        }
        let positive = [
            ("volume_ratio_min", self.volume_ratio_min),
            ("min_rr_ratio", self.min_rr_ratio),
            ("risk_multiplier", self.risk_multiplier),
            ("take_profit_pct", self.take_profit_pct),
            ("stop_loss_pct", self.stop_loss_pct),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !v.is_finite() || *v <= 0.0) {
            return Err(Error::Config(format!("{name} must be positive, got {value}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SignalConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let cfg: SignalConfig = toml::from_str(
            r#"
            rsi_oversold = 30.0
            level_mode = "percent"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rsi_oversold, 30.0);
        assert_eq!(cfg.rsi_overbought, 65.0);
        assert_eq!(cfg.level_mode, LevelMode::Percent);
    }

    #[test]
    fn inverted_rsi_thresholds_rejected() {
        let cfg = SignalConfig {
            rsi_oversold: 70.0,
            rsi_overbought: 30.0,
            ..SignalConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_multiplier_rejected() {
        let cfg = SignalConfig {
            risk_multiplier: 0.0,
            ..SignalConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(m)) if m.contains("risk_multiplier")));
    }
}
