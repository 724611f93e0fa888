//! Direction labels for supervised training.

use market_core::Bar;

/// Label each bar with the sign of the forward return over `horizon` bars.
/// `Some(true)` = close rose, `Some(false)` = close fell or was flat,
/// `None` = the horizon extends past the series (excluded from training).
pub fn direction_labels(bars: &[Bar], horizon: usize) -> Vec<Option<bool>> {
    let n = bars.len();
    (0..n)
        .map(|i| {
            if horizon == 0 || i + horizon >= n {
                None
            } else {
                Some(bars[i + horizon].close > bars[i].close)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 15, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: start + Duration::minutes(5 * i as i64),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn labels_follow_forward_close() {
        let bars = bars_from_closes(&[100.0, 101.0, 99.0, 102.0]);
        let labels = direction_labels(&bars, 1);
        assert_eq!(labels, vec![Some(true), Some(false), Some(true), None]);
    }

    #[test]
    fn unrealised_tail_is_none() {
        let bars = bars_from_closes(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let labels = direction_labels(&bars, 3);
        assert_eq!(labels.iter().filter(|l| l.is_none()).count(), 3);
    }

    #[test]
    fn flat_close_counts_as_down() {
        let bars = bars_from_closes(&[100.0, 100.0]);
        let labels = direction_labels(&bars, 1);
        assert_eq!(labels[0], Some(false));
    }
}
