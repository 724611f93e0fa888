//! Probability + confidence → discrete signal label.

use market_core::{LabelThresholds, SignalLabel};

/// Map the consensus probability and confidence onto a label. The strong
/// variants additionally require the confidence gate; the plain variants
/// key on probability alone.
pub fn map_label(probability: f64, confidence: f64, t: &LabelThresholds) -> SignalLabel {
    if probability >= t.strong_buy_prob && confidence >= t.strong_confidence {
        SignalLabel::StrongBuy
    } else if probability >= t.buy_prob {
        SignalLabel::Buy
    } else if probability <= t.strong_sell_prob && confidence >= t.strong_confidence {
        SignalLabel::StrongSell
    } else if probability <= t.sell_prob {
        SignalLabel::Sell
    } else {
        SignalLabel::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> LabelThresholds {
        LabelThresholds::default()
    }

    #[test]
    fn strong_buy_needs_confidence() {
        assert_eq!(map_label(0.75, 0.8, &defaults()), SignalLabel::StrongBuy);
        assert_eq!(map_label(0.75, 0.3, &defaults()), SignalLabel::Buy);
    }

    #[test]
    fn strong_sell_needs_confidence() {
        assert_eq!(map_label(0.25, 0.8, &defaults()), SignalLabel::StrongSell);
        assert_eq!(map_label(0.25, 0.3, &defaults()), SignalLabel::Sell);
    }

    #[test]
    fn midpoint_with_zero_confidence_is_hold() {
        assert_eq!(map_label(0.5, 0.0, &defaults()), SignalLabel::Hold);
    }

    #[test]
    fn boundary_values_take_the_stronger_side() {
        assert_eq!(map_label(0.55, 0.0, &defaults()), SignalLabel::Buy);
        assert_eq!(map_label(0.45, 0.0, &defaults()), SignalLabel::Sell);
        assert_eq!(map_label(0.70, 0.60, &defaults()), SignalLabel::StrongBuy);
        assert_eq!(map_label(0.30, 0.60, &defaults()), SignalLabel::StrongSell);
    }

    #[test]
    fn between_bands_is_hold() {
        assert_eq!(map_label(0.50, 0.9, &defaults()), SignalLabel::Hold);
        assert_eq!(map_label(0.46, 0.9, &defaults()), SignalLabel::Hold);
        assert_eq!(map_label(0.54, 0.9, &defaults()), SignalLabel::Hold);
    }
}
