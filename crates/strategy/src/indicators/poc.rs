use common::Candle;

/// Point of control: median candle midpoint pooled across every frame.
///
/// `None` when no candles are supplied at all.
pub fn point_of_control(frames: &[&[Candle]]) -> Option<f64> {
    let mut mids: Vec<f64> = frames
        .iter()
        .flat_map(|frame| frame.iter().map(Candle::midpoint))
        .filter(|m| m.is_finite())
        .collect();
    if mids.is_empty() {
        return None;
    }
    mids.sort_by(f64::total_cmp);
    let mid = mids.len() / 2;
    if mids.len() % 2 == 0 {
        Some((mids[mid - 1] + mids[mid]) / 2.0)
    } else {
        Some(mids[mid])
    }
}
