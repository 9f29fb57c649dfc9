// =============================================================================
// Indicators — pure series math over snapshot price history
// =============================================================================
//
// Side-effect-free helpers consumed by the rule evaluator (indicator
// conditions) and the scheduler (volatility-adaptive snapshot cadence).
// Every function returns `Option`/empty on insufficient data so callers are
// forced to treat "not enough history" as a failed condition, never a panic.
// =============================================================================

/// RSI series over `closes` (Wilder smoothing), one value per close once
/// `period` steps of history exist. Needs at least `period + 1` closes;
/// anything less (or a zero period) yields an empty series. A window with
/// no down moves pins the index at 100.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    let span = period as f64;
    let mut up_ema = 0.0_f64;
    let mut down_ema = 0.0_f64;
    let mut series = Vec::with_capacity(closes.len() - period);

    for (step, pair) in closes.windows(2).enumerate() {
        let change = pair[1] - pair[0];
        let up = change.max(0.0);
        let down = (-change).max(0.0);

        if step < period {
            // Warm-up: the first `period` steps average into the seed.
            up_ema += up / span;
            down_ema += down / span;
            if step + 1 < period {
                continue;
            }
        } else {
            up_ema += (up - up_ema) / span;
            down_ema += (down - down_ema) / span;
        }

        match strength_index(up_ema, down_ema) {
            Some(value) => series.push(value),
            None => break,
        }
    }

    series
}

/// Most recent RSI value, or `None` on insufficient data.
pub fn current_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

/// Simple moving average of the trailing `period` values.
pub fn current_sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Sample standard deviation of per-step percentage returns.
///
/// This is the volatility measure used both for `indicator{volatility}`
/// conditions and for the snapshot cadence controller. Returns `None` when
/// fewer than three prices (two returns) are available, since a sample
/// stddev needs n >= 2.
pub fn returns_stddev_pct(prices: &[f64]) -> Option<f64> {
    if prices.len() < 3 {
        return None;
    }

    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0] * 100.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    std.is_finite().then_some(std)
}

/// Map smoothed up/down movement onto the 0..=100 index scale. A dead-flat
/// window (no movement either way) reads as neutral 50.
fn strength_index(up: f64, down: f64) -> Option<f64> {
    let value = if down > 0.0 {
        100.0 * up / (up + down)
    } else if up > 0.0 {
        100.0
    } else {
        50.0
    };
    value.is_finite().then_some(value)
}
