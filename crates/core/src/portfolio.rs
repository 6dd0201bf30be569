//! Frozen per-cycle view of the portfolio.
//!
//! The orchestrator captures one [`PortfolioState`] at the start of each cycle
//! and shares it behind an `Arc`; nothing mutates it afterwards, so every
//! trader in the cycle decides against the same numbers.

use crate::events::Side;
use crate::position::Position;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Open position counts per side for one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideCounts {
    pub buy: u32,
    pub sell: u32,
}

impl SideCounts {
    #[must_use]
    pub const fn get(&self, side: Side) -> u32 {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioState {
    pub version: u64,
    pub equity: Decimal,
    pub open_position_count: u32,
    /// Summed open risk in percent of equity
    pub aggregate_risk_percent: Decimal,
    pub emergency_stop: bool,
    pub last_snapshot_at: DateTime<Utc>,
    pub exposure: HashMap<String, SideCounts>,
}

impl PortfolioState {
    /// Captures a snapshot from the open positions.
    ///
    /// Positions without a stop, or a non-positive equity with any open risk,
    /// saturate the aggregate at 100% so no further risk can be approved.
    pub fn capture<'a>(
        version: u64,
        equity: Decimal,
        positions: impl IntoIterator<Item = &'a Position>,
        emergency_stop: bool,
    ) -> Self {
        let mut exposure: HashMap<String, SideCounts> = HashMap::new();
        let mut count = 0u32;
        let mut risk_amount = Decimal::ZERO;
        let mut unbounded = false;

        for pos in positions {
            count += 1;
            let counts = exposure.entry(pos.instrument.clone()).or_default();
            match pos.side {
                Side::Buy => counts.buy += 1,
                Side::Sell => counts.sell += 1,
            }
            match pos.risk_amount() {
                Some(amount) => risk_amount += amount,
                None => unbounded = true,
            }
        }

        let aggregate_risk_percent = if unbounded {
            Decimal::ONE_HUNDRED
        } else if risk_amount.is_zero() {
            Decimal::ZERO
        } else if equity <= Decimal::ZERO {
            Decimal::ONE_HUNDRED
        } else {
            risk_amount / equity * Decimal::ONE_HUNDRED
        };

        Self {
            version,
            equity,
            open_position_count: count,
            aggregate_risk_percent,
            emergency_stop,
            last_snapshot_at: Utc::now(),
            exposure,
        }
    }

    /// Open positions on `instrument` in the same direction as `side`.
    #[must_use]
    pub fn same_direction_count(&self, instrument: &str, side: Side) -> u32 {
        self.exposure.get(instrument).map_or(0, |c| c.get(side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentSpec;
    use rust_decimal_macros::dec;

    fn position(ticket: u64, instrument: &str, side: Side, stop: Option<Decimal>) -> Position {
        let spec = InstrumentSpec {
            pip_size: dec!(0.0001),
            pip_value_per_lot: dec!(10),
            volume_step: dec!(0.01),
            volume_min: dec!(0.01),
            volume_max: dec!(100),
        };
        Position::open(ticket, instrument, side, dec!(0.2), dec!(1.1000), stop, None, spec)
    }

    #[test]
    fn capture_aggregates_counts_and_risk() {
        let positions = vec![
            position(1, "EURUSD", Side::Buy, Some(dec!(1.0950))),
            position(2, "EURUSD", Side::Buy, Some(dec!(1.0950))),
            position(3, "GBPUSD", Side::Sell, Some(dec!(1.1050))),
        ];
        let state = PortfolioState::capture(7, dec!(10000), &positions, false);

        assert_eq!(state.version, 7);
        assert_eq!(state.open_position_count, 3);
        // 3 positions × $100 risk on $10k equity
        assert_eq!(state.aggregate_risk_percent, dec!(3));
        assert_eq!(state.same_direction_count("EURUSD", Side::Buy), 2);
        assert_eq!(state.same_direction_count("EURUSD", Side::Sell), 0);
        assert_eq!(state.same_direction_count("USDJPY", Side::Buy), 0);
    }

    #[test]
    fn position_without_stop_saturates_risk() {
        let positions = vec![position(1, "EURUSD", Side::Buy, None)];
        let state = PortfolioState::capture(1, dec!(10000), &positions, false);
        assert_eq!(state.aggregate_risk_percent, Decimal::ONE_HUNDRED);
    }

    #[test]
    fn empty_book_has_no_risk_even_without_equity() {
        let state = PortfolioState::capture(1, Decimal::ZERO, std::iter::empty(), true);
        assert_eq!(state.aggregate_risk_percent, Decimal::ZERO);
        assert!(state.emergency_stop);
    }
}
