use common::Candle;

/// Current candle volume over the mean volume of the preceding
/// `window - 1` candles.
///
/// Returns `0.0` when fewer than `window` candles exist or the trailing
/// average is zero.
pub fn volume_ratio(candles: &[Candle], window: usize) -> f64 {
    if window < 2 || candles.len() < window {
        return 0.0;
    }
    let n = candles.len();
    let current = candles[n - 1].volume;
    let trailing = &candles[n - window..n - 1];
    let avg = trailing.iter().map(|c| c.volume).sum::<f64>() / trailing.len() as f64;
    if avg <= 0.0 {
        return 0.0;
    }
    current / avg
}

/// Buy-minus-sell volume as a percentage of total volume, in `[-100, 100]`.
///
/// A candle's volume counts as buy volume when `close >= open`.
pub fn delta(candles: &[Candle]) -> f64 {
    let (buy, sell) = candles.iter().fold((0.0, 0.0), |(buy, sell), c| {
        if c.close >= c.open {
            (buy + c.volume, sell)
        } else {
            (buy, sell + c.volume)
        }
    });
    let total = buy + sell;
    if total <= 0.0 {
        return 0.0;
    }
    ((buy - sell) / total * 100.0).clamp(-100.0, 100.0)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn bar(open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume,
        }
    }

    #[test]
    fn ratio_excludes_current_from_average() {
        let mut candles: Vec<Candle> = (0..19).map(|_| bar(1.0, 1.0, 100.0)).collect();
        candles.push(bar(1.0, 1.1, 150.0));
        assert!((volume_ratio(&candles, 20) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn ratio_uses_only_trailing_window() {
        // older candles outside the window must not matter
        let mut candles: Vec<Candle> = (0..10).map(|_| bar(1.0, 1.0, 1_000.0)).collect();
        candles.extend((0..2).map(|_| bar(1.0, 1.0, 10.0)));
        candles.push(bar(1.0, 1.0, 20.0));
        assert!((volume_ratio(&candles, 3) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn ratio_short_or_silent_history_is_zero() {
        let candles: Vec<Candle> = (0..5).map(|_| bar(1.0, 1.0, 10.0)).collect();
        assert_eq!(volume_ratio(&candles, 20), 0.0);
        let silent: Vec<Candle> = (0..20).map(|_| bar(1.0, 1.0, 0.0)).collect();
        assert_eq!(volume_ratio(&silent, 20), 0.0);
    }

    #[test]
    fn delta_classifies_flat_candles_as_buy() {
        let candles = vec![bar(1.0, 1.0, 30.0), bar(1.0, 0.9, 10.0)];
        assert!((delta(&candles) - 50.0).abs() < 1e-12);
    }

    #[test]
    fn delta_without_volume_is_zero() {
        assert_eq!(delta(&[]), 0.0);
        assert_eq!(delta(&[bar(1.0, 2.0, 0.0)]), 0.0);
    }

    #[test]
    fn delta_all_sell_is_minus_100() {
        let candles = vec![bar(2.0, 1.0, 5.0), bar(2.0, 1.5, 5.0)];
        assert_eq!(delta(&candles), -100.0);
    }
}
