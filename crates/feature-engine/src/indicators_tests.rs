use super::indicators::*;
use chrono::{Duration, TimeZone, Utc};
use market_core::Bar;

// Helper function to create sample price data
fn sample_prices() -> Vec<f64> {
    vec![
        44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
        45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
    ]
}

// Helper function to create sample bars
fn sample_bars(n: usize) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 15, 0).unwrap();
    (0..n)
        .map(|i| {
            let close = 100.0 + i as f64 + (i as f64 * 0.9).sin();
            Bar {
                timestamp: start + Duration::minutes(5 * i as i64),
                open: close - 0.5,
                high: close + 2.0,
                low: close - 2.0,
                close,
                volume: 1_000_000.0 + (i as f64) * 100.0,
            }
        })
        .collect()
}

#[test]
fn test_sma_alignment() {
    let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    let result = sma(&data, 3);

    assert_eq!(result.len(), 5);
    assert!(result[0].is_nan());
    assert!(result[1].is_nan());
    assert!((result[2] - 2.0).abs() < 1e-9); // (1+2+3)/3
    assert!((result[3] - 3.0).abs() < 1e-9);
    assert!((result[4] - 4.0).abs() < 1e-9);
}

#[test]
fn test_sma_insufficient_data() {
    let data = vec![1.0, 2.0];
    let result = sma(&data, 5);
    assert!(result.iter().all(|v| v.is_nan()));
}

#[test]
fn test_sma_real_prices() {
    let prices = sample_prices();
    let result = sma(&prices, 5);
    let expected_first = (44.34 + 44.09 + 44.15 + 43.61 + 44.33) / 5.0;
    assert!((result[4] - expected_first).abs() < 0.01);
}

#[test]
fn test_ema_seed_is_sma() {
    let data = vec![2.0, 4.0, 6.0, 8.0, 10.0];
    let result = ema(&data, 3);
    assert!(result[1].is_nan());
    assert!((result[2] - 4.0).abs() < 1e-9); // SMA seed
    // next: (8 - 4) * 0.5 + 4 = 6
    assert!((result[3] - 6.0).abs() < 1e-9);
}

#[test]
fn test_rsi_range_and_alignment() {
    let prices = sample_prices();
    let result = rsi(&prices, 14);
    assert_eq!(result.len(), prices.len());
    assert!(result[13].is_nan());
    for v in result.iter().skip(14) {
        assert!((0.0..=100.0).contains(v));
    }
}

#[test]
fn test_rsi_all_gains_saturates() {
    let data: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
    let result = rsi(&data, 14);
    assert!((result.last().unwrap() - 100.0).abs() < 1e-9);
}

#[test]
fn test_macd_alignment() {
    let prices: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
    let result = macd(&prices, 12, 26, 9);
    assert_eq!(result.line.len(), 60);
    assert!(result.line[24].is_nan());
    assert!(result.line[25].is_finite());
    assert!(result.signal[32].is_nan());
    assert!(result.signal[33].is_finite());
    assert!(result.histogram[33].is_finite());
    let last = result.line.len() - 1;
    assert!(
        (result.histogram[last] - (result.line[last] - result.signal[last])).abs() < 1e-9
    );
}

#[test]
fn test_bollinger_bounds() {
    let prices = sample_prices();
    let bb = bollinger(&prices, 10, 2.0);
    for i in 9..prices.len() {
        assert!(bb.lower[i] <= bb.middle[i]);
        assert!(bb.middle[i] <= bb.upper[i]);
        assert!((0.0..=1.0).contains(&bb.position[i].clamp(0.0, 1.0)));
    }
}

#[test]
fn test_atr_positive_after_warmup() {
    let bars = sample_bars(40);
    let result = atr(&bars, 14);
    assert_eq!(result.len(), 40);
    assert!(result[13].is_nan());
    assert!(result[14].is_finite());
    for v in result.iter().skip(14) {
        assert!(*v > 0.0);
    }
}

#[test]
fn test_adx_defined_after_double_period() {
    let bars = sample_bars(80);
    let result = adx(&bars, 14);
    assert!(result.adx[27].is_nan());
    assert!(result.adx[28].is_finite());
    for v in result.adx.iter().filter(|v| v.is_finite()) {
        assert!((0.0..=100.0).contains(v));
    }
}

#[test]
fn test_stochastic_range() {
    let bars = sample_bars(40);
    let result = stochastic(&bars, 14, 3);
    for v in result.k.iter().filter(|v| v.is_finite()) {
        assert!((0.0..=100.0).contains(v));
    }
    assert!(result.d[14].is_nan());
    assert!(result.d[15].is_finite());
}

#[test]
fn test_williams_r_range() {
    let bars = sample_bars(30);
    let result = williams_r(&bars, 14);
    for v in result.iter().filter(|v| v.is_finite()) {
        assert!((-100.0..=0.0).contains(v));
    }
}

#[test]
fn test_obv_accumulates_by_direction() {
    let bars = sample_bars(10);
    let result = obv(&bars);
    assert_eq!(result.len(), 10);
    // closes are strictly rising in the sample, so OBV rises
    for w in result.windows(2) {
        assert!(w[1] >= w[0]);
    }
}

#[test]
fn test_zscore_of_constant_series_is_zero() {
    let data = vec![5.0; 30];
    let result = zscore(&data, 10);
    for v in result.iter().skip(9) {
        assert_eq!(*v, 0.0);
    }
}

#[test]
fn test_returns_simple() {
    let data = vec![100.0, 110.0, 121.0];
    let result = returns(&data, 1);
    assert!(result[0].is_nan());
    assert!((result[1] - 0.10).abs() < 1e-9);
    assert!((result[2] - 0.10).abs() < 1e-9);
}

#[test]
fn test_ichimoku_components() {
    let bars = sample_bars(60);
    let ichi = ichimoku(&bars, 9, 26, 26);
    assert!(ichi.conversion[7].is_nan());
    assert!(ichi.conversion[8].is_finite());
    assert!(ichi.base[24].is_nan());
    assert!(ichi.base[25].is_finite());
    assert!(ichi.leading_a[25].is_finite());
    assert!(ichi.lagging[25].is_nan());
    assert!(ichi.lagging[26].is_finite());
}

#[test]
fn test_range_position_in_unit_interval() {
    let bars = sample_bars(60);
    let result = range_position(&bars, 20);
    for v in result.iter().filter(|v| v.is_finite()) {
        assert!((0.0..=1.0).contains(v));
    }
}

#[test]
fn test_cci_zero_mean_dev_guard() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 15, 0).unwrap();
    let bars: Vec<Bar> = (0..25)
        .map(|i| Bar {
            timestamp: start + Duration::minutes(i as i64),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 10.0,
        })
        .collect();
    let result = cci(&bars, 20);
    assert_eq!(*result.last().unwrap(), 0.0);
}
