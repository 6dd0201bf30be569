use crate::approval::RejectionReason;
use chrono::{DateTime, Utc};
use fx_engine_core::error::ErrorKind;
use fx_engine_core::events::{ExecutionOutcome, Signal, Ticket};
use fx_engine_core::portfolio::PortfolioState;
use fx_engine_core::position_sizing::SizingDecision;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What happened to one instrument during one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentReport {
    pub instrument: String,
    pub signal: Option<Signal>,
    pub rejection: Option<RejectionReason>,
    pub sizing: Option<SizingDecision>,
    pub outcome: Option<ExecutionOutcome>,
    /// Set when the instrument could not be evaluated (no data, strategy error, bad sizing input)
    pub skipped: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl InstrumentReport {
    #[must_use]
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            signal: None,
            rejection: None,
            sizing: None,
            outcome: None,
            skipped: None,
            error_kind: None,
        }
    }

    #[must_use]
    pub fn skipped(instrument: impl Into<String>, kind: Option<ErrorKind>, reason: impl Into<String>) -> Self {
        Self {
            skipped: Some(reason.into()),
            error_kind: kind,
            ..Self::new(instrument)
        }
    }

    /// True if an order was filled for this instrument.
    #[must_use]
    pub fn opened_position(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LifecycleActionKind {
    Breakeven { new_stop: Decimal },
    Trail { new_stop: Decimal },
    PartialClose { volume: Decimal },
    /// Partial close would leave less than the broker minimum; marked done without a call
    PartialCloseSkipped { volume: Decimal },
    EarlyClose { probability: f64 },
    EmergencyClose,
    /// Broker no longer reports the ticket (stop or target filled broker-side)
    ClosedByBroker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleAction {
    pub ticket: Ticket,
    pub instrument: String,
    pub action: LifecycleActionKind,
    /// `None` for actions that needed no broker call
    pub outcome: Option<ExecutionOutcome>,
}

impl LifecycleAction {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().map_or(true, |o| o.success)
    }
}

/// Everything observable about one cycle, published on the engine's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleResult {
    pub cycle: u64,
    pub config_version: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub emergency_stop: bool,
    /// Account snapshot failure; no trader was dispatched when set
    pub account_error: Option<String>,
    pub per_instrument: Vec<InstrumentReport>,
    pub lifecycle_actions: Vec<LifecycleAction>,
    pub portfolio_after: PortfolioState,
}

impl CycleResult {
    #[must_use]
    pub fn report(&self, instrument: &str) -> Option<&InstrumentReport> {
        self.per_instrument.iter().find(|r| r.instrument == instrument)
    }

    #[must_use]
    pub fn orders_filled(&self) -> usize {
        self.per_instrument.iter().filter(|r| r.opened_position()).count()
    }
}
