use crate::config::InstrumentSpec;
use crate::events::{Side, Ticket};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Progress of the lifecycle rules applied to a position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub breakeven_applied: bool,
    /// Price at which the stop was last trailed; `None` until trailing starts
    pub trail_anchor: Option<Decimal>,
    pub partial_closed: bool,
}

/// An open position as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub instrument: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub current_stop: Option<Decimal>,
    pub current_target: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    /// `"{instrument}:{side}"`, positions sharing a group are stacked
    pub stack_group: String,
    pub lifecycle: LifecycleState,
    pub spec: InstrumentSpec,
}

impl Position {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        ticket: Ticket,
        instrument: impl Into<String>,
        side: Side,
        volume: Decimal,
        entry_price: Decimal,
        stop: Option<Decimal>,
        target: Option<Decimal>,
        spec: InstrumentSpec,
    ) -> Self {
        let instrument = instrument.into();
        let stack_group = stack_group(&instrument, side);
        Self {
            ticket,
            instrument,
            side,
            volume,
            entry_price,
            current_stop: stop,
            current_target: target,
            opened_at: Utc::now(),
            stack_group,
            lifecycle: LifecycleState::default(),
            spec,
        }
    }

    /// Favourable move from entry in pips; negative when losing.
    #[must_use]
    pub fn profit_pips(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.side.sign() / self.spec.pip_size
    }

    #[must_use]
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.profit_pips(price) * self.volume * self.spec.pip_value_per_lot
    }

    /// Money lost if the current stop is hit; zero once the stop is at or past entry.
    ///
    /// A position without a stop has unbounded risk and reports `None`.
    #[must_use]
    pub fn risk_amount(&self) -> Option<Decimal> {
        let stop = self.current_stop?;
        let adverse_pips = (self.entry_price - stop) * self.side.sign() / self.spec.pip_size;
        Some(adverse_pips.max(Decimal::ZERO) * self.volume * self.spec.pip_value_per_lot)
    }

    /// True if `candidate` reduces risk relative to the current stop.
    #[must_use]
    pub fn is_tighter_stop(&self, candidate: Decimal) -> bool {
        match (self.current_stop, self.side) {
            (None, _) => true,
            (Some(stop), Side::Buy) => candidate > stop,
            (Some(stop), Side::Sell) => candidate < stop,
        }
    }
}

#[must_use]
pub fn stack_group(instrument: &str, side: Side) -> String {
    format!("{instrument}:{side:?}")
}
