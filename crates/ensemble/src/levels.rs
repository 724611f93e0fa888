//! ATR-anchored entry / stop / target levels.

use market_core::{CoreError, CoreResult, LevelStyle, SignalLabel, TradeLevels};

/// Derive trading levels for a signal. HOLD gets no levels. The ordering
/// invariant (stop < entry < t1 <= t2 on the buy side, mirrored for sell)
/// is enforced; a violation is a configuration or data fault surfaced as
/// `InvalidLevels`.
pub fn compute_levels(
    symbol: &str,
    label: SignalLabel,
    reference_price: f64,
    atr: f64,
    style: LevelStyle,
) -> CoreResult<Option<TradeLevels>> {
    if label == SignalLabel::Hold {
        return Ok(None);
    }
    let (k_sl, k_t1, k_t2) = style.multipliers();

    let levels = if label.is_buy_side() {
        TradeLevels {
            entry: reference_price,
            stop_loss: reference_price - k_sl * atr,
            target_1: reference_price + k_t1 * atr,
            target_2: reference_price + k_t2 * atr,
        }
    } else {
        TradeLevels {
            entry: reference_price,
            stop_loss: reference_price + k_sl * atr,
            target_1: reference_price - k_t1 * atr,
            target_2: reference_price - k_t2 * atr,
        }
    };

    validate_levels(symbol, label, &levels)?;
    Ok(Some(levels))
}

fn validate_levels(symbol: &str, label: SignalLabel, l: &TradeLevels) -> CoreResult<()> {
    let finite = [l.entry, l.stop_loss, l.target_1, l.target_2]
        .iter()
        .all(|v| v.is_finite());
    let ordered = if label.is_buy_side() {
        l.stop_loss < l.entry && l.entry < l.target_1 && l.target_1 <= l.target_2
    } else {
        l.target_2 <= l.target_1 && l.target_1 < l.entry && l.entry < l.stop_loss
    };
    if !finite || !ordered {
        return Err(CoreError::InvalidLevels {
            symbol: symbol.to_string(),
            entry: l.entry,
            stop_loss: l.stop_loss,
            target_1: l.target_1,
            target_2: l.target_2,
        });
    }
    Ok(())
}
