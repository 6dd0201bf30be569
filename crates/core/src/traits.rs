use crate::error::BrokerError;
use crate::events::{AccountState, Bar, BrokerFill, OrderRequest, Prediction, Signal, Ticket};
use crate::position::Position;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Most recent `count` bars, oldest first.
    async fn recent_bars(&self, instrument: &str, timeframe: &str, count: usize) -> Result<Vec<Bar>>;
}

/// Connection to the broker.
///
/// The underlying link is not reentrant: implementations may assume calls
/// never overlap. Only `ExecutionManager` holds a connector, behind its mutex.
#[async_trait]
pub trait BrokerConnector: Send {
    async fn submit_order(&mut self, order: &OrderRequest) -> Result<BrokerFill, BrokerError>;

    /// Closes `volume` lots of the position, or all of it when `None`.
    async fn close_position(
        &mut self,
        ticket: Ticket,
        volume: Option<Decimal>,
    ) -> Result<BrokerFill, BrokerError>;

    /// Sets new stop and/or target; `None` leaves the current value.
    async fn modify_position(
        &mut self,
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> Result<(), BrokerError>;

    async fn account_state(&mut self) -> Result<AccountState, BrokerError>;

    /// Tickets the broker currently reports as open.
    async fn open_tickets(&mut self) -> Result<Vec<Ticket>, BrokerError>;
}

#[async_trait]
pub trait Strategy: Send + Sync {
    async fn analyze(&self, instrument: &str, bars: &[Bar]) -> Result<Signal>;
    fn name(&self) -> &str;
}

/// ML or sentiment model consulted to confirm technical signals.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, instrument: &str, bars: &[Bar]) -> Result<Prediction>;
}

/// Model consulted by the lifecycle sweep for early exits.
#[async_trait]
pub trait ExitAdvisor: Send + Sync {
    /// Probability in [0, 1] that `position` ends profitable, or `None` when
    /// the model has no opinion.
    async fn profit_probability(&self, position: &Position, price: Decimal) -> Result<Option<f64>>;
}
