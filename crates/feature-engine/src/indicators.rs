//! Indicator kernels over aligned series.
//!
//! Every kernel returns a vector the same length as its input, with
//! `f64::NAN` marking positions inside the indicator's warmup window.
//! Alignment is what lets the feature matrix stack kernels column-wise
//! without offset bookkeeping.

use market_core::Bar;

/// Return val if it is finite, otherwise return default.
#[inline]
pub fn finite_or(val: f64, default: f64) -> f64 {
    if val.is_finite() {
        val
    } else {
        default
    }
}

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if period == 0 || data.len() < period {
        return out;
    }
    let mut sum: f64 = data[..period].iter().sum();
    out[period - 1] = finite_or(sum / period as f64, 0.0);
    for i in period..data.len() {
        sum += data[i] - data[i - period];
        out[i] = finite_or(sum / period as f64, 0.0);
    }
    out
}

/// Exponential Moving Average, SMA-seeded at index `period - 1`.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if period == 0 || data.len() < period {
        return out;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = data[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = finite_or(seed, 0.0);
    for i in period..data.len() {
        let prev = out[i - 1];
        out[i] = finite_or((data[i] - prev) * multiplier + prev, prev);
    }
    out
}

/// Rolling sample standard deviation.
pub fn rolling_std(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if period < 2 || data.len() < period {
        return out;
    }
    for i in period - 1..data.len() {
        let slice = &data[i + 1 - period..=i];
        let mean = slice.iter().sum::<f64>() / period as f64;
        let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        out[i] = finite_or(var.sqrt(), 0.0);
    }
    out
}

/// Fractional return over `horizon` bars: data[i] / data[i - horizon] - 1.
pub fn returns(data: &[f64], horizon: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if horizon == 0 {
        return out;
    }
    for i in horizon..data.len() {
        let base = data[i - horizon];
        if base != 0.0 {
            out[i] = finite_or(data[i] / base - 1.0, 0.0);
        } else {
            out[i] = 0.0;
        }
    }
    out
}

/// Realised volatility: rolling std of single-period returns.
pub fn realised_vol(data: &[f64], window: usize) -> Vec<f64> {
    let rets = returns(data, 1);
    let mut out = vec![f64::NAN; data.len()];
    if window < 2 || data.len() < window + 1 {
        return out;
    }
    for i in window..data.len() {
        let slice = &rets[i + 1 - window..=i];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        out[i] = finite_or(var.sqrt(), 0.0);
    }
    out
}

/// Relative Strength Index (Wilder smoothing).
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; data.len()];
    if period == 0 || data.len() < period + 1 {
        return out;
    }

    let mut gains = Vec::with_capacity(data.len() - 1);
    let mut losses = Vec::with_capacity(data.len() - 1);
    for i in 1..data.len() {
        let change = data[i] - data[i - 1];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut avg_gain = gains[..period].iter().sum::<f64>() / period as f64;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / period as f64;
    out[period] = rsi_from_averages(avg_gain, avg_loss);

    for i in period..gains.len() {
        avg_gain = (avg_gain * (period - 1) as f64 + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + losses[i]) / period as f64;
        out[i + 1] = rsi_from_averages(avg_gain, avg_loss);
    }
    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    finite_or(100.0 - 100.0 / (1.0 + rs), 50.0)
}

/// MACD line / signal / histogram, aligned to the input.
pub struct MacdSeries {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(data: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let n = data.len();
    let mut line = vec![f64::NAN; n];
    let mut signal = vec![f64::NAN; n];
    let mut histogram = vec![f64::NAN; n];

    if fast == 0 || slow == 0 || signal_period == 0 || slow <= fast || n < slow {
        return MacdSeries {
            line,
            signal,
            histogram,
        };
    }

    let ema_fast = ema(data, fast);
    let ema_slow = ema(data, slow);
    for i in slow - 1..n {
        line[i] = ema_fast[i] - ema_slow[i];
    }

    // EMA of the defined portion of the line
    let defined = &line[slow - 1..];
    let sig = ema(defined, signal_period);
    for (j, v) in sig.iter().enumerate() {
        signal[slow - 1 + j] = *v;
    }
    for i in 0..n {
        if line[i].is_finite() && signal[i].is_finite() {
            histogram[i] = line[i] - signal[i];
        }
    }

    MacdSeries {
        line,
        signal,
        histogram,
    }
}

/// Bollinger Bands plus derived width and band position.
pub struct BollingerSeries {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
    pub width: Vec<f64>,
    pub position: Vec<f64>,
}

pub fn bollinger(data: &[f64], period: usize, std_dev: f64) -> BollingerSeries {
    let n = data.len();
    let middle = sma(data, period);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    let mut width = vec![f64::NAN; n];
    let mut position = vec![f64::NAN; n];

    if period == 0 || n < period {
        return BollingerSeries {
            upper,
            middle,
            lower,
            width,
            position,
        };
    }

    for i in period - 1..n {
        let slice = &data[i + 1 - period..=i];
        let mean = middle[i];
        let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / period as f64;
        let std = var.sqrt();
        let up = finite_or(mean + std_dev * std, mean);
        let lo = finite_or(mean - std_dev * std, mean);
        upper[i] = up;
        lower[i] = lo;
        width[i] = if mean != 0.0 {
            finite_or((up - lo) / mean, 0.0)
        } else {
            0.0
        };
        position[i] = if up > lo {
            finite_or((data[i] - lo) / (up - lo), 0.5)
        } else {
            0.5
        };
    }

    BollingerSeries {
        upper,
        middle,
        lower,
        width,
        position,
    }
}

/// Average True Range (Wilder smoothing).
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return out;
    }

    let mut true_ranges = Vec::with_capacity(n - 1);
    for i in 1..n {
        let hl = bars[i].high - bars[i].low;
        let hc = (bars[i].high - bars[i - 1].close).abs();
        let lc = (bars[i].low - bars[i - 1].close).abs();
        true_ranges.push(hl.max(hc).max(lc));
    }

    let mut val = true_ranges[..period].iter().sum::<f64>() / period as f64;
    out[period] = finite_or(val, 0.0);
    for i in period..true_ranges.len() {
        val = (val * (period - 1) as f64 + true_ranges[i]) / period as f64;
        out[i + 1] = finite_or(val, 0.0);
    }
    out
}

/// Average Directional Index — trend strength (0-100), aligned.
pub struct AdxSeries {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

pub fn adx(bars: &[Bar], period: usize) -> AdxSeries {
    let n = bars.len();
    let mut adx_out = vec![f64::NAN; n];
    let mut plus_out = vec![f64::NAN; n];
    let mut minus_out = vec![f64::NAN; n];

    if period == 0 || n < period * 2 + 1 {
        return AdxSeries {
            adx: adx_out,
            plus_di: plus_out,
            minus_di: minus_out,
        };
    }

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    let mut true_range = Vec::with_capacity(n - 1);
    for i in 1..n {
        let up_move = bars[i].high - bars[i - 1].high;
        let down_move = bars[i - 1].low - bars[i].low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        let hl = bars[i].high - bars[i].low;
        let hc = (bars[i].high - bars[i - 1].close).abs();
        let lc = (bars[i].low - bars[i - 1].close).abs();
        true_range.push(hl.max(hc).max(lc));
    }

    // Wilder's smoothed sums
    let mut smoothed_plus = plus_dm[..period].iter().sum::<f64>();
    let mut smoothed_minus = minus_dm[..period].iter().sum::<f64>();
    let mut smoothed_tr = true_range[..period].iter().sum::<f64>();

    let mut dx_values = Vec::new();
    for i in period..plus_dm.len() {
        smoothed_plus = smoothed_plus - smoothed_plus / period as f64 + plus_dm[i];
        smoothed_minus = smoothed_minus - smoothed_minus / period as f64 + minus_dm[i];
        smoothed_tr = smoothed_tr - smoothed_tr / period as f64 + true_range[i];

        let pdi = if smoothed_tr > 0.0 {
            100.0 * smoothed_plus / smoothed_tr
        } else {
            0.0
        };
        let mdi = if smoothed_tr > 0.0 {
            100.0 * smoothed_minus / smoothed_tr
        } else {
            0.0
        };
        // dm index i corresponds to bar index i + 1
        plus_out[i + 1] = pdi;
        minus_out[i + 1] = mdi;

        let di_sum = pdi + mdi;
        dx_values.push(if di_sum > 0.0 {
            100.0 * (pdi - mdi).abs() / di_sum
        } else {
            0.0
        });
    }

    if dx_values.len() >= period {
        let mut val = dx_values[..period].iter().sum::<f64>() / period as f64;
        // first DX sits at bar index period + 1; the seed average lands
        // `period` DX values later
        adx_out[2 * period] = finite_or(val, 0.0);
        for j in period..dx_values.len() {
            val = (val * (period - 1) as f64 + dx_values[j]) / period as f64;
            adx_out[j + period + 1] = finite_or(val, 0.0);
        }
    }

    AdxSeries {
        adx: adx_out,
        plus_di: plus_out,
        minus_di: minus_out,
    }
}

/// Stochastic Oscillator %K / %D.
pub struct StochasticSeries {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

pub fn stochastic(bars: &[Bar], k_period: usize, d_period: usize) -> StochasticSeries {
    let n = bars.len();
    let mut k = vec![f64::NAN; n];
    if k_period == 0 || n < k_period {
        return StochasticSeries {
            d: vec![f64::NAN; n],
            k,
        };
    }

    for i in k_period - 1..n {
        let slice = &bars[i + 1 - k_period..=i];
        let highest = slice.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = slice.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        k[i] = if highest == lowest {
            50.0
        } else {
            finite_or(100.0 * (bars[i].close - lowest) / (highest - lowest), 50.0)
        };
    }

    // %D is an SMA of the defined %K region
    let mut d = vec![f64::NAN; n];
    let defined = &k[k_period - 1..];
    let d_vals = sma(defined, d_period);
    for (j, v) in d_vals.iter().enumerate() {
        d[k_period - 1 + j] = *v;
    }

    StochasticSeries { k, d }
}

/// Williams %R (-100..0).
pub fn williams_r(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    for i in period - 1..n {
        let slice = &bars[i + 1 - period..=i];
        let highest = slice.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = slice.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        out[i] = if highest == lowest {
            -50.0
        } else {
            finite_or(-100.0 * (highest - bars[i].close) / (highest - lowest), -50.0)
        };
    }
    out
}

/// Commodity Channel Index.
pub fn cci(bars: &[Bar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if period == 0 || n < period {
        return out;
    }
    let typical: Vec<f64> = bars.iter().map(|b| (b.high + b.low + b.close) / 3.0).collect();
    for i in period - 1..n {
        let slice = &typical[i + 1 - period..=i];
        let mean = slice.iter().sum::<f64>() / period as f64;
        let mean_dev = slice.iter().map(|x| (x - mean).abs()).sum::<f64>() / period as f64;
        out[i] = if mean_dev == 0.0 {
            0.0
        } else {
            finite_or((typical[i] - mean) / (0.015 * mean_dev), 0.0)
        };
    }
    out
}

/// Rate of Change, in percent.
pub fn roc(data: &[f64], period: usize) -> Vec<f64> {
    returns(data, period).iter().map(|r| r * 100.0).collect()
}

/// On-Balance Volume
pub fn obv(bars: &[Bar]) -> Vec<f64> {
    if bars.is_empty() {
        return vec![];
    }
    let mut out = Vec::with_capacity(bars.len());
    out.push(bars[0].volume);
    for i in 1..bars.len() {
        let prev = out[i - 1];
        out.push(if bars[i].close > bars[i - 1].close {
            prev + bars[i].volume
        } else if bars[i].close < bars[i - 1].close {
            prev - bars[i].volume
        } else {
            prev
        });
    }
    out
}

/// Rolling z-score of a series.
pub fn zscore(data: &[f64], window: usize) -> Vec<f64> {
    let n = data.len();
    let mut out = vec![f64::NAN; n];
    if window < 2 || n < window {
        return out;
    }
    for i in window - 1..n {
        let slice = &data[i + 1 - window..=i];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        let std = var.sqrt();
        out[i] = if std > 0.0 {
            finite_or((data[i] - mean) / std, 0.0)
        } else {
            0.0
        };
    }
    out
}

/// Ichimoku components, expressed relative to price by the caller.
pub struct IchimokuSeries {
    pub conversion: Vec<f64>,
    pub base: Vec<f64>,
    pub leading_a: Vec<f64>,
    /// Close relative to close `lag` bars ago (chikou-style backward look).
    pub lagging: Vec<f64>,
}

pub fn ichimoku(bars: &[Bar], conversion_period: usize, base_period: usize, lag: usize) -> IchimokuSeries {
    let n = bars.len();
    let midline = |period: usize| -> Vec<f64> {
        let mut out = vec![f64::NAN; n];
        if period == 0 || n < period {
            return out;
        }
        for i in period - 1..n {
            let slice = &bars[i + 1 - period..=i];
            let highest = slice.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
            let lowest = slice.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
            out[i] = (highest + lowest) / 2.0;
        }
        out
    };

    let conversion = midline(conversion_period);
    let base = midline(base_period);
    let mut leading_a = vec![f64::NAN; n];
    for i in 0..n {
        if conversion[i].is_finite() && base[i].is_finite() {
            leading_a[i] = (conversion[i] + base[i]) / 2.0;
        }
    }

    let mut lagging = vec![f64::NAN; n];
    for i in lag..n {
        let past = bars[i - lag].close;
        lagging[i] = if past != 0.0 {
            finite_or(bars[i].close / past - 1.0, 0.0)
        } else {
            0.0
        };
    }

    IchimokuSeries {
        conversion,
        base,
        leading_a,
        lagging,
    }
}

/// Position of the close within the rolling high-low range, in [0, 1].
pub fn range_position(bars: &[Bar], window: usize) -> Vec<f64> {
    let n = bars.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }
    for i in window - 1..n {
        let slice = &bars[i + 1 - window..=i];
        let highest = slice.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lowest = slice.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        out[i] = if highest > lowest {
            finite_or((bars[i].close - lowest) / (highest - lowest), 0.5)
        } else {
            0.5
        };
    }
    out
}

/// Ratio of two aligned series minus one, NaN where either side is undefined.
pub fn ratio(numerator: &[f64], denominator: &[f64]) -> Vec<f64> {
    numerator
        .iter()
        .zip(denominator.iter())
        .map(|(a, b)| {
            if a.is_finite() && b.is_finite() && *b != 0.0 {
                finite_or(a / b - 1.0, 0.0)
            } else {
                f64::NAN
            }
        })
        .collect()
}
