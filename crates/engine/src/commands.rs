use crate::events::CycleResult;
use chrono::{DateTime, Utc};
use fx_engine_core::position::Position;
use fx_engine_execution::BreakerSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum EngineCommand {
    Start,
    Pause,
    Resume,
    Stop,
    /// Blocks new exposure, runs one containment cycle and stops the engine
    EmergencyStop(oneshot::Sender<CycleResult>),
    /// Runs one cycle now, regardless of the schedule
    RunCycle(oneshot::Sender<CycleResult>),
    GetStatus(oneshot::Sender<EngineStatus>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Stop,
    /// Current cycle finished after a stop request
    Finish,
    Emergency,
}

impl EngineState {
    /// Next state, or `None` if the transition is not allowed from here.
    #[must_use]
    pub const fn apply(self, transition: Transition) -> Option<Self> {
        match (self, transition) {
            (Self::Idle, Transition::Start) | (Self::Paused, Transition::Resume) => Some(Self::Running),
            (Self::Running, Transition::Pause) => Some(Self::Paused),
            (Self::Idle | Self::Running | Self::Paused, Transition::Stop) => Some(Self::Stopping),
            (Self::Stopping, Transition::Finish) => Some(Self::Stopped),
            (Self::Idle | Self::Running | Self::Paused | Self::Stopping, Transition::Emergency) => {
                Some(Self::Stopped)
            }
            _ => None,
        }
    }

    /// Cycles run on the schedule only while running.
    #[must_use]
    pub const fn is_scheduled(self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Engine state published on the status watch channel after every command and cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub cycle: u64,
    pub config_version: u64,
    pub emergency_stop: bool,
    pub breaker: BreakerSnapshot,
    pub open_positions: Vec<Position>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
