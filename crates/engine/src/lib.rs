pub mod approval;
pub mod commands;
pub mod events;
pub mod handle;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod trader;

pub use approval::{ApprovalGate, ApprovalRequest, RejectionReason};
pub use commands::{EngineCommand, EngineState, EngineStatus, Transition};
pub use events::{CycleResult, InstrumentReport, LifecycleAction, LifecycleActionKind};
pub use handle::EngineHandle;
pub use ledger::{LedgerTotals, Reservation, RiskLedger};
pub use lifecycle::{PositionLifecycleManager, SweepContext};
pub use orchestrator::{Orchestrator, StrategyFactory};
pub use trader::{CycleContext, InstrumentTrader, TraderOutput};
