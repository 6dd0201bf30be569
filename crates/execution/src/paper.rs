//! In-memory broker connector for paper sessions and tests.
//!
//! Positions are filled at the last marked price. Stops and targets are
//! enforced broker-side whenever a new price is marked, so the engine sees
//! them disappear from `open_tickets` exactly as with a live broker. Failures
//! can be queued with [`PaperBroker::inject_failure`]; each queued error is
//! returned by the next mutating call.

use async_trait::async_trait;
use fx_engine_core::config::InstrumentSpec;
use fx_engine_core::error::BrokerError;
use fx_engine_core::events::{AccountState, BrokerFill, OrderRequest, Side, Ticket};
use fx_engine_core::traits::BrokerConnector;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Margin reserved per lot (1:100 leverage on a 100k contract).
const DEFAULT_MARGIN_PER_LOT: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq)]
pub struct PaperPosition {
    pub instrument: String,
    pub side: Side,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub stop: Option<Decimal>,
    pub target: Option<Decimal>,
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    margin_per_lot: Decimal,
    next_ticket: Ticket,
    prices: HashMap<String, Decimal>,
    specs: HashMap<String, InstrumentSpec>,
    positions: BTreeMap<Ticket, PaperPosition>,
    faults: VecDeque<BrokerError>,
    calls: u64,
}

impl PaperState {
    fn pnl(&self, pos: &PaperPosition, price: Decimal) -> Decimal {
        self.specs.get(&pos.instrument).map_or(Decimal::ZERO, |spec| {
            (price - pos.entry_price) * pos.side.sign() / spec.pip_size
                * pos.volume
                * spec.pip_value_per_lot
        })
    }

    fn equity(&self) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .values()
            .map(|pos| {
                let price = self.prices.get(&pos.instrument).copied().unwrap_or(pos.entry_price);
                self.pnl(pos, price)
            })
            .sum();
        self.balance + unrealized
    }

    fn margin(&self) -> Decimal {
        self.positions.values().map(|p| p.volume).sum::<Decimal>() * self.margin_per_lot
    }

    fn take_fault(&mut self) -> Result<(), BrokerError> {
        self.faults.pop_front().map_or(Ok(()), Err)
    }

    fn price(&self, instrument: &str) -> Result<Decimal, BrokerError> {
        self.prices
            .get(instrument)
            .copied()
            .ok_or(BrokerError::MarketClosed)
    }

    fn realize(&mut self, ticket: Ticket, volume: Decimal, price: Decimal) -> Result<BrokerFill, BrokerError> {
        let pos = self
            .positions
            .get(&ticket)
            .cloned()
            .ok_or(BrokerError::PositionNotFound { ticket })?;
        if volume <= Decimal::ZERO || volume > pos.volume {
            return Err(BrokerError::InvalidVolume { volume });
        }

        let closed = PaperPosition {
            volume,
            ..pos.clone()
        };
        self.balance += self.pnl(&closed, price);

        if volume == pos.volume {
            self.positions.remove(&ticket);
        } else if let Some(open) = self.positions.get_mut(&ticket) {
            open.volume -= volume;
        }
        Ok(BrokerFill {
            ticket,
            price,
            volume,
        })
    }
}

/// Cloneable handle; clones share the same simulated account.
#[derive(Debug, Clone)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
}

impl PaperBroker {
    #[must_use]
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                balance,
                margin_per_lot: DEFAULT_MARGIN_PER_LOT,
                next_ticket: 1,
                prices: HashMap::new(),
                specs: HashMap::new(),
                positions: BTreeMap::new(),
                faults: VecDeque::new(),
                calls: 0,
            })),
        }
    }

    /// Builder method to set the margin reserved per lot.
    #[must_use]
    pub fn with_margin_per_lot(self, margin: Decimal) -> Self {
        self.state.lock().margin_per_lot = margin;
        self
    }

    pub fn register_instrument(&self, instrument: impl Into<String>, spec: InstrumentSpec) {
        self.state.lock().specs.insert(instrument.into(), spec);
    }

    /// Sets the current price and closes positions whose stop or target it crosses.
    pub fn mark_price(&self, instrument: &str, price: Decimal) {
        let mut state = self.state.lock();
        state.prices.insert(instrument.to_string(), price);

        let hits: Vec<(Ticket, Decimal, Decimal)> = state
            .positions
            .iter()
            .filter(|(_, p)| p.instrument == instrument)
            .filter_map(|(ticket, p)| {
                let stop_hit = p.stop.filter(|s| match p.side {
                    Side::Buy => price <= *s,
                    Side::Sell => price >= *s,
                });
                let target_hit = p.target.filter(|t| match p.side {
                    Side::Buy => price >= *t,
                    Side::Sell => price <= *t,
                });
                stop_hit.or(target_hit).map(|level| (*ticket, p.volume, level))
            })
            .collect();

        for (ticket, volume, level) in hits {
            if state.realize(ticket, volume, level).is_ok() {
                info!(ticket, instrument, price = %level, "Paper position closed broker-side");
            }
        }
    }

    /// Queues an error returned by the next mutating call.
    pub fn inject_failure(&self, error: BrokerError) {
        self.state.lock().faults.push_back(error);
    }

    /// Connector calls received, read-only ones included.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    #[must_use]
    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    #[must_use]
    pub fn equity(&self) -> Decimal {
        self.state.lock().equity()
    }

    #[must_use]
    pub fn position(&self, ticket: Ticket) -> Option<PaperPosition> {
        self.state.lock().positions.get(&ticket).cloned()
    }

    #[must_use]
    pub fn open_position_count(&self) -> usize {
        self.state.lock().positions.len()
    }
}

#[async_trait]
impl BrokerConnector for PaperBroker {
    async fn submit_order(&mut self, order: &OrderRequest) -> Result<BrokerFill, BrokerError> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.take_fault()?;

        let price = state.price(&order.instrument)?;
        if (price - order.reference_price).abs() > order.max_slippage {
            return Err(BrokerError::Requote { price });
        }
        let spec = state
            .specs
            .get(&order.instrument)
            .ok_or_else(|| BrokerError::rejected(10013, format!("unknown symbol {}", order.instrument)))?;
        if order.volume < spec.volume_min || order.volume > spec.volume_max {
            return Err(BrokerError::InvalidVolume {
                volume: order.volume,
            });
        }
        let stop_valid = match order.side {
            Side::Buy => order.stop_loss < price,
            Side::Sell => order.stop_loss > price,
        };
        if !stop_valid {
            return Err(BrokerError::InvalidStops);
        }
        let required = order.volume * state.margin_per_lot;
        if state.equity() - state.margin() < required {
            return Err(BrokerError::InsufficientMargin);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            PaperPosition {
                instrument: order.instrument.clone(),
                side: order.side,
                volume: order.volume,
                entry_price: price,
                stop: Some(order.stop_loss),
                target: order.take_profit,
            },
        );
        debug!(ticket, instrument = %order.instrument, side = ?order.side, volume = %order.volume, %price, "Paper order filled");

        Ok(BrokerFill {
            ticket,
            price,
            volume: order.volume,
        })
    }

    async fn close_position(
        &mut self,
        ticket: Ticket,
        volume: Option<Decimal>,
    ) -> Result<BrokerFill, BrokerError> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.take_fault()?;

        let pos = state
            .positions
            .get(&ticket)
            .cloned()
            .ok_or(BrokerError::PositionNotFound { ticket })?;
        let price = state.price(&pos.instrument)?;
        state.realize(ticket, volume.unwrap_or(pos.volume), price)
    }

    async fn modify_position(
        &mut self,
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.take_fault()?;

        let instrument = state
            .positions
            .get(&ticket)
            .map(|p| p.instrument.clone())
            .ok_or(BrokerError::PositionNotFound { ticket })?;
        let price = state.price(&instrument)?;
        let pos = state
            .positions
            .get_mut(&ticket)
            .ok_or(BrokerError::PositionNotFound { ticket })?;

        if let Some(stop) = stop {
            let valid = match pos.side {
                Side::Buy => stop < price,
                Side::Sell => stop > price,
            };
            if !valid {
                return Err(BrokerError::InvalidStops);
            }
            pos.stop = Some(stop);
        }
        if target.is_some() {
            pos.target = target;
        }
        Ok(())
    }

    async fn account_state(&mut self) -> Result<AccountState, BrokerError> {
        let mut state = self.state.lock();
        state.calls += 1;
        let equity = state.equity();
        let margin = state.margin();
        Ok(AccountState {
            equity,
            margin,
            free_margin: equity - margin,
        })
    }

    async fn open_tickets(&mut self) -> Result<Vec<Ticket>, BrokerError> {
        let mut state = self.state.lock();
        state.calls += 1;
        Ok(state.positions.keys().copied().collect())
    }
}
