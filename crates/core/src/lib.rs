pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod error;
pub mod events;
pub mod portfolio;
pub mod position;
pub mod position_sizing;
pub mod traits;

pub use config::{
    ConfigSnapshot, EngineConfig, InstrumentConfig, InstrumentSpec, SharedConfig,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use error::{BrokerError, ConfigError, DataError, ErrorKind, SizingError};
pub use events::{
    AccountState, Bar, BrokerFill, ExecutionOutcome, OrderRequest, Prediction, Side, Signal,
    SignalDirection, Ticket,
};
pub use portfolio::{PortfolioState, SideCounts};
pub use position::{LifecycleState, Position};
pub use position_sizing::{calculate_position_size, SizingDecision};
pub use traits::{BrokerConnector, ExitAdvisor, MarketDataProvider, Predictor, Strategy};
