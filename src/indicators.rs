// =============================================================================
// Indicator math — EMA, RSI, realized volatility, efficiency ratio
// =============================================================================
//
// Pure functions over price slices. The technical provider and the regime
// classifier both consume these; nothing here holds state.
// =============================================================================

/// Exponential moving average over `closes` with the given period.
/// Returns one value per input once `period` samples are available.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len() - period + 1);

    // Seed with the SMA of the first `period` closes.
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out.push(seed);

    let mut prev = seed;
    for &close in &closes[period..] {
        let ema = alpha * close + (1.0 - alpha) * prev;
        out.push(ema);
        prev = ema;
    }
    out
}

/// Relative Strength Index (Wilder smoothing). Returns `None` until
/// `period + 1` closes are available.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for w in closes[..period + 1].windows(2) {
        let delta = w[1] - w[0];
        if delta >= 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Realized volatility: standard deviation of log returns over the slice,
/// expressed as a fraction (0.02 = 2 % per sample interval). Returns `None`
/// with fewer than three samples or any non-positive price.
pub fn realized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 3 || closes.iter().any(|&c| c <= 0.0) {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect();

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (returns.len() as f64 - 1.0);

    Some(var.sqrt())
}

/// Kaufman efficiency ratio: |net change| / sum of |changes| over the slice.
/// 1.0 is a perfectly straight move, 0.0 pure chop. Returns `None` with
/// fewer than three samples.
pub fn efficiency_ratio(closes: &[f64]) -> Option<f64> {
    if closes.len() < 3 {
        return None;
    }

    let net = (closes[closes.len() - 1] - closes[0]).abs();
    let path: f64 = closes.windows(2).map(|w| (w[1] - w[0]).abs()).sum();

    if path == 0.0 {
        return Some(0.0);
    }
    Some((net / path).clamp(0.0, 1.0))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_sma_and_smooths() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = calculate_ema(&closes, 3);
        assert_eq!(ema.len(), 3);
        assert!((ema[0] - 2.0).abs() < 1e-12);
        // alpha = 0.5: 0.5*4 + 0.5*2 = 3.0, then 0.5*5 + 0.5*3 = 4.0
        assert!((ema[1] - 3.0).abs() < 1e-12);
        assert!((ema[2] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn ema_insufficient_data_is_empty() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        assert_eq!(calculate_rsi(&closes, 14), Some(100.0));
    }

    #[test]
    fn rsi_alternating_is_midrange() {
        let mut closes = vec![100.0];
        for i in 1..30 {
            closes.push(if i % 2 == 0 { 100.0 } else { 101.0 });
        }
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!(rsi > 30.0 && rsi < 70.0, "rsi={rsi}");
    }

    #[test]
    fn volatility_of_constant_series_is_zero() {
        let closes = vec![100.0; 10];
        assert!(realized_volatility(&closes).unwrap() < 1e-12);
    }

    #[test]
    fn volatility_grows_with_swing_size() {
        let calm: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        let wild: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64 * 5.0).collect();
        assert!(realized_volatility(&wild).unwrap() > realized_volatility(&calm).unwrap());
    }

    #[test]
    fn efficiency_ratio_of_straight_move_is_one() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert!((efficiency_ratio(&closes).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn efficiency_ratio_of_round_trip_is_low() {
        let closes = vec![100.0, 105.0, 100.0, 105.0, 100.0];
        assert!(efficiency_ratio(&closes).unwrap() < 0.1);
    }
}
