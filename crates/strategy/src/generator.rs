use chrono::{DateTime, Utc};
use tracing::debug;

use common::{Candle, Direction, Instrument, RejectionReason, Signal, Targets};

use crate::config::{LevelMode, SignalConfig};
use crate::indicators::IndicatorSet;

const RSI_POINTS_PER_UNIT: f64 = 3.0;
const RSI_CAP: f64 = 30.0;
const VOLUME_POINTS_PER_UNIT: f64 = 30.0;
const VOLUME_CAP: f64 = 30.0;
const PATTERN_POINTS: f64 = 20.0;
const RR_POINTS_PER_UNIT: f64 = 10.0;
const RR_CAP: f64 = 20.0;

/// Outcome of evaluating one instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// RSI, volume or trend gates did not line up.
    Neutral,
    /// A directional setup exists but policy declined to emit it.
    Rejected {
        direction: Direction,
        reason: RejectionReason,
    },
    Emit(Signal),
}

impl Decision {
    /// Direction of the setup, whether or not it was emitted.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Decision::Neutral => None,
            Decision::Rejected { direction, .. } => Some(*direction),
            Decision::Emit(signal) => Some(signal.direction),
        }
    }
}

/// What the latest data says about an already-open position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendAssessment {
    Unchanged,
    /// The trend has turned against the position.
    Reversal,
    /// Momentum continues in the position's favour; candidate new levels.
    Reinforced(Targets),
}

/// Turns an [`IndicatorSet`] into a [`Decision`]. Holds no per-instrument state.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Run the NEUTRAL -> {LONG, SHORT} gates for one instrument.
    ///
    /// `candles` must be the same window `indicators` was computed from.
    pub fn evaluate(
        &self,
        instrument: &Instrument,
        candles: &[Candle],
        indicators: &IndicatorSet,
        now: DateTime<Utc>,
    ) -> Decision {
        let Some(direction) = self.rsi_gate(indicators.rsi) else {
            return Decision::Neutral;
        };
        if indicators.volume_ratio < self.config.volume_ratio_min
            || !momentum_confirms(direction, candles)
        {
            return Decision::Neutral;
        }
        if self.config.trend_filter && !trend_aligned(direction, indicators) {
            return Decision::Neutral;
        }

        let entry = indicators.price;
        let raw = match self.levels(direction, entry, indicators.atr) {
            Some(t) => t,
            None => {
                return Decision::Rejected {
                    direction,
                    reason: RejectionReason::InvalidLevels("ATR is zero".into()),
                }
            }
        };

        // Small epsilon so ATR mode, which targets exactly min_rr, is not
        // rejected on float noise.
        let ratio = raw.risk_reward(entry);
        if ratio + 1e-9 < self.config.min_rr_ratio {
            return Decision::Rejected {
                direction,
                reason: RejectionReason::RiskRewardTooLow {
                    ratio,
                    minimum: self.config.min_rr_ratio,
                },
            };
        }

        let targets = Targets {
            take_profit: round_to_tick(raw.take_profit, instrument.tick_size),
            stop_loss: round_to_tick(raw.stop_loss, instrument.tick_size),
        };
        let confidence = self.confidence(
            direction,
            candles,
            indicators,
            targets.risk_reward(entry),
        );
        if confidence < self.config.confidence_threshold {
            return Decision::Rejected {
                direction,
                reason: RejectionReason::ConfidenceBelowThreshold {
                    confidence,
                    threshold: self.config.confidence_threshold,
                },
            };
        }

        let rationale = format!(
            "RSI {:.1}, volume x{:.2}, delta {:.1}, R:R {:.2}",
            indicators.rsi,
            indicators.volume_ratio,
            indicators.delta,
            targets.risk_reward(entry)
        );
        match Signal::new(
            &instrument.symbol,
            direction,
            entry,
            targets,
            confidence,
            now,
            rationale,
        ) {
            Ok(signal) => Decision::Emit(signal),
            Err(e) => {
                debug!(instrument = %instrument.symbol, error = %e, "Levels collapsed after tick rounding");
                Decision::Rejected {
                    direction,
                    reason: RejectionReason::InvalidLevels(e.to_string()),
                }
            }
        }
    }

    /// Judge an open position against fresh indicators.
    pub fn assess_trend(
        &self,
        direction: Direction,
        entry: f64,
        instrument: &Instrument,
        candles: &[Candle],
        indicators: &IndicatorSet,
    ) -> TrendAssessment {
        let price = indicators.price;
        let (ma_s, ma_l) = (indicators.ma_short, indicators.ma_long);
        let trend = indicators.has_trend();

        let reversal = match direction {
            Direction::Long => {
                indicators.rsi >= self.config.rsi_overbought || (trend && ma_s < ma_l && price < ma_s)
            }
            Direction::Short => {
                indicators.rsi <= self.config.rsi_oversold || (trend && ma_s > ma_l && price > ma_s)
            }
        };
        if reversal {
            return TrendAssessment::Reversal;
        }

        let aligned = trend
            && match direction {
                Direction::Long => ma_s > ma_l && price > entry,
                Direction::Short => ma_s < ma_l && price < entry,
            };
        if !aligned || !last_candle_with(direction, candles) || indicators.atr <= 0.0 {
            return TrendAssessment::Unchanged;
        }

        let risk = indicators.atr * self.config.risk_multiplier;
        let sign = direction.sign();
        TrendAssessment::Reinforced(Targets {
            take_profit: round_to_tick(
                price + sign * risk * self.config.min_rr_ratio,
                instrument.tick_size,
            ),
            stop_loss: round_to_tick(price - sign * risk, instrument.tick_size),
        })
    }

    fn rsi_gate(&self, rsi: f64) -> Option<Direction> {
        if rsi <= self.config.rsi_oversold {
            Some(Direction::Long)
        } else if rsi >= self.config.rsi_overbought {
            Some(Direction::Short)
        } else {
            None
        }
    }

    /// Unrounded levels, or `None` when ATR mode has no volatility to work with.
    fn levels(&self, direction: Direction, entry: f64, atr: f64) -> Option<Targets> {
        let sign = direction.sign();
        match self.config.level_mode {
            LevelMode::Percent => Some(Targets {
                take_profit: entry * (1.0 + sign * self.config.take_profit_pct),
                stop_loss: entry * (1.0 - sign * self.config.stop_loss_pct),
            }),
            LevelMode::Atr => {
                if atr <= 0.0 {
                    return None;
                }
                let risk = atr * self.config.risk_multiplier;
                Some(Targets {
                    take_profit: entry + sign * risk * self.config.min_rr_ratio,
                    stop_loss: entry - sign * risk,
                })
            }
        }
    }

    /// Weighted 0..=100 score, rounded to one decimal.
    pub fn confidence(
        &self,
        direction: Direction,
        candles: &[Candle],
        indicators: &IndicatorSet,
        risk_reward: f64,
    ) -> f64 {
        let extremity = match direction {
            Direction::Long => self.config.rsi_oversold - indicators.rsi,
            Direction::Short => indicators.rsi - self.config.rsi_overbought,
        };
        let rsi_score = (extremity.max(0.0) * RSI_POINTS_PER_UNIT).min(RSI_CAP);
        let volume_score =
            ((indicators.volume_ratio - 1.0) * VOLUME_POINTS_PER_UNIT).clamp(0.0, VOLUME_CAP);
        let pattern_score = if has_reversal_pattern(direction, candles) {
            PATTERN_POINTS
        } else {
            0.0
        };
        let rr_score = (risk_reward * RR_POINTS_PER_UNIT).clamp(0.0, RR_CAP);

        let total = (rsi_score + volume_score + pattern_score + rr_score).clamp(0.0, 100.0);
        (total * 10.0).round() / 10.0
    }
}

/// Current and previous candle both move with `direction`, and the current
/// close extends beyond the previous one.
pub fn momentum_confirms(direction: Direction, candles: &[Candle]) -> bool {
    let [.., prev, cur] = candles else {
        return false;
    };
    match direction {
        Direction::Long => prev.is_bullish() && cur.is_bullish() && cur.close > prev.close,
        Direction::Short => prev.is_bearish() && cur.is_bearish() && cur.close < prev.close,
    }
}

fn last_candle_with(direction: Direction, candles: &[Candle]) -> bool {
    match (direction, candles.last()) {
        (Direction::Long, Some(c)) => c.is_bullish(),
        (Direction::Short, Some(c)) => c.is_bearish(),
        (_, None) => false,
    }
}

fn trend_aligned(direction: Direction, ind: &IndicatorSet) -> bool {
    if !ind.has_trend() {
        return false;
    }
    match direction {
        Direction::Long => ind.price > ind.ma_short && ind.ma_short > ind.ma_long,
        Direction::Short => ind.price < ind.ma_short && ind.ma_short < ind.ma_long,
    }
}

/// Among the last three candles, a candle against `direction` followed by
/// one with it that closes beyond the first's extreme.
pub fn has_reversal_pattern(direction: Direction, candles: &[Candle]) -> bool {
    let start = candles.len().saturating_sub(3);
    candles[start..].windows(2).any(|w| {
        let (first, second) = (&w[0], &w[1]);
        match direction {
            Direction::Long => {
                first.is_bearish() && second.is_bullish() && second.close > first.high
            }
            Direction::Short => {
                first.is_bullish() && second.is_bearish() && second.close < first.low
            }
        }
    })
}

/// Round `price` to the nearest multiple of `tick`. A non-positive tick
/// leaves the price untouched.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 || !tick.is_finite() || !price.is_finite() {
        return price;
    }
    let rounded = (price / tick).round() * tick;
    // Trim float noise (e.g. 0.30000000000000004) to the tick's precision.
    let factor = 10f64.powi(tick_decimals(tick));
    (rounded * factor).round() / factor
}

/// Decimal places needed to write `tick` exactly (0.25 -> 2, 0.0025 -> 4).
fn tick_decimals(tick: f64) -> i32 {
    (0..=12)
        .find(|&d| {
            let scaled = tick * 10f64.powi(d);
            (scaled - scaled.round()).abs() < 1e-9 * scaled.max(1.0)
        })
        .unwrap_or(12)
}
