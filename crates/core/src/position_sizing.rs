use crate::config::InstrumentSpec;
use crate::error::SizingError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Result of sizing an approved signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingDecision {
    Trade {
        /// Lots, rounded down to the volume step and capped at the maximum
        volume: Decimal,
        /// Money lost if the stop is hit at `volume`
        risk_amount: Decimal,
        /// `risk_amount` in percent of equity
        risk_percent: Decimal,
        stop_distance_pips: Decimal,
    },
    /// Volume rounds below the broker minimum; not an error.
    NoTrade { raw_volume: Decimal },
}

impl SizingDecision {
    #[must_use]
    pub const fn volume(&self) -> Option<Decimal> {
        match self {
            Self::Trade { volume, .. } => Some(*volume),
            Self::NoTrade { .. } => None,
        }
    }
}

/// Calculate position size from the equity risked on the stop distance
///
/// # Arguments
/// * `equity` - Account equity in account currency
/// * `risk_percent` - Percentage of equity to lose if the stop is hit (1 = 1%)
/// * `entry_price` - Expected entry price
/// * `stop_price` - Protective stop; required
/// * `spec` - Pip size, pip value and volume limits of the instrument
///
/// # Returns
/// `volume = (equity × risk_percent / 100) / (stop distance in pips × pip value per lot)`,
/// rounded down to the volume step.
///
/// # Errors
/// Returns `SizingError` if the stop is missing, the stop distance is zero or
/// any numeric input is not positive.
pub fn calculate_position_size(
    equity: Decimal,
    risk_percent: Decimal,
    entry_price: Decimal,
    stop_price: Option<Decimal>,
    spec: &InstrumentSpec,
) -> Result<SizingDecision, SizingError> {
    let stop_price = stop_price.ok_or(SizingError::MissingStop)?;

    for (field, value) in [
        ("equity", equity),
        ("risk_percent", risk_percent),
        ("entry_price", entry_price),
        ("pip_size", spec.pip_size),
        ("pip_value_per_lot", spec.pip_value_per_lot),
    ] {
        if value <= Decimal::ZERO {
            return Err(SizingError::NonPositive { field, value });
        }
    }

    let stop_distance_pips = (entry_price - stop_price).abs() / spec.pip_size;
    if stop_distance_pips.is_zero() {
        return Err(SizingError::ZeroStopDistance);
    }

    let risk_budget = equity * risk_percent / Decimal::ONE_HUNDRED;
    let risk_per_lot = stop_distance_pips * spec.pip_value_per_lot;
    let raw_volume = risk_budget / risk_per_lot;

    let volume = spec.round_down(raw_volume.min(spec.volume_max));
    if volume.is_zero() || volume < spec.volume_min {
        return Ok(SizingDecision::NoTrade { raw_volume });
    }

    let risk_amount = volume * risk_per_lot;
    Ok(SizingDecision::Trade {
        volume,
        risk_amount,
        risk_percent: risk_amount / equity * Decimal::ONE_HUNDRED,
        stop_distance_pips,
    })
}
