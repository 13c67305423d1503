/// Simple moving average of the last `period` values.
///
/// Returns `0.0` (undefined) when fewer than `period` values are available.
pub fn sma(values: &[f64], period: usize) -> f64 {
    if period == 0 || values.len() < period {
        return 0.0;
    }
    values[values.len() - period..].iter().sum::<f64>() / period as f64
}
