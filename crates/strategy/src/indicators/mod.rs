pub mod atr;
pub mod average;
pub mod poc;
pub mod rsi;
pub mod volume;

pub use atr::atr;
pub use average::sma;
pub use poc::point_of_control;
pub use rsi::{RsiIndicator, NEUTRAL_RSI};
pub use volume::{delta, volume_ratio};

use common::Candle;
use serde::Serialize;

/// Lookback lengths for one indicator pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub ma_short: usize,
    pub ma_long: usize,
    pub atr_period: usize,
    pub volume_window: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            ma_short: 20,
            ma_long: 50,
            atr_period: 14,
            volume_window: 20,
        }
    }
}

/// Indicator snapshot for one instrument at one evaluation time.
///
/// Built fresh on every scan and never mutated afterwards. Moving averages
/// and ATR carry `0.0` when their lookback is not yet filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSet {
    /// Close of the most recent candle.
    pub price: f64,
    pub rsi: f64,
    pub ma_short: f64,
    pub ma_long: f64,
    pub atr: f64,
    pub volume_ratio: f64,
    pub delta: f64,
    pub poc: Option<f64>,
}

impl IndicatorSet {
    /// Compute every indicator from `candles` (oldest first).
    ///
    /// `poc_frames` are the multi-timeframe candle sets pooled for the point
    /// of control. Returns `None` when there are fewer than `rsi_period + 1`
    /// candles; the caller treats that as "no signal this cycle".
    pub fn compute(
        candles: &[Candle],
        params: &IndicatorParams,
        poc_frames: &[&[Candle]],
    ) -> Option<Self> {
        let rsi = RsiIndicator::new(params.rsi_period);
        if !rsi.has_enough(candles.len()) {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let price = *closes.last()?;
        let window_start = candles.len().saturating_sub(params.volume_window);

        Some(Self {
            price,
            rsi: rsi.compute(&closes),
            ma_short: sma(&closes, params.ma_short),
            ma_long: sma(&closes, params.ma_long),
            atr: atr(candles, params.atr_period),
            volume_ratio: volume_ratio(candles, params.volume_window),
            delta: delta(&candles[window_start..]),
            poc: point_of_control(poc_frames),
        })
    }

    /// Both moving averages have enough history to be meaningful.
    pub fn has_trend(&self) -> bool {
        self.ma_short > 0.0 && self.ma_long > 0.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.7).sin() * 3.0;
                Candle {
                    open_time: Utc::now(),
                    open: close - 0.2,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 10.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn insufficient_history_yields_none() {
        let candles = series(14);
        assert!(IndicatorSet::compute(&candles, &IndicatorParams::default(), &[]).is_none());
    }

    #[test]
    fn partial_history_leaves_long_ma_undefined() {
        let candles = series(30);
        let set = IndicatorSet::compute(&candles, &IndicatorParams::default(), &[]).unwrap();
        assert!(set.ma_short > 0.0);
        assert_eq!(set.ma_long, 0.0);
        assert!(!set.has_trend());
        assert!(set.poc.is_none());
        assert_eq!(set.price, candles[29].close);
    }

    #[test]
    fn full_history_fills_every_indicator() {
        let candles = series(100);
        let set =
            IndicatorSet::compute(&candles, &IndicatorParams::default(), &[&candles]).unwrap();
        assert!(set.has_trend());
        assert!((0.0..=100.0).contains(&set.rsi));
        assert!(set.atr > 0.0);
        assert!(set.volume_ratio > 0.0);
        assert!((-100.0..=100.0).contains(&set.delta));
        assert!(set.poc.is_some());
    }
}
