use common::Candle;

/// Average True Range over the last `period` true ranges.
///
/// Each true range needs the previous close, so `period + 1` candles are
/// required. Returns `0.0` otherwise; callers treat zero ATR as "no levels".
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }

    let ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let recent = &ranges[ranges.len() - period..];
    recent.iter().sum::<f64>() / period as f64
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn atr_uses_gap_from_previous_close() {
        // second bar gaps up: high - prev_close = 4 beats high - low = 1
        let candles = vec![bar(10.0, 10.5, 9.5, 10.0), bar(13.5, 14.0, 13.0, 13.5)];
        assert!((atr(&candles, 1) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn atr_averages_last_period_ranges() {
        let candles = vec![
            bar(10.0, 11.0, 9.0, 10.0),
            bar(10.0, 11.0, 9.0, 10.0), // tr 2
            bar(10.0, 10.5, 9.5, 10.0), // tr 1
            bar(10.0, 10.5, 9.5, 10.0), // tr 1
        ];
        assert!((atr(&candles, 2) - 1.0).abs() < 1e-12);
        assert!((atr(&candles, 3) - 4.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn atr_needs_period_plus_one() {
        let candles = vec![bar(10.0, 11.0, 9.0, 10.0); 14];
        assert_eq!(atr(&candles, 14), 0.0);
    }
}
