//! Engine actor: owns the traders, the lifecycle manager and the execution
//! manager, and runs trading cycles on a fixed schedule.
//!
//! Commands arrive on an mpsc channel and are only handled between cycles.
//! Each cycle reads one configuration snapshot, captures one frozen
//! `PortfolioState`, dispatches the traders (serially or through a bounded
//! pool), then sweeps open positions. Results go out on a broadcast channel
//! and the status on a watch channel.

use crate::approval::ApprovalGate;
use crate::commands::{EngineCommand, EngineState, EngineStatus, Transition};
use crate::events::{CycleResult, InstrumentReport};
use crate::handle::EngineHandle;
use crate::ledger::RiskLedger;
use crate::lifecycle::{PositionLifecycleManager, SweepContext};
use crate::trader::{CycleContext, InstrumentTrader, TraderOutput};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use fx_engine_core::config::{EngineConfig, InstrumentConfig, PortfolioLimits, SharedConfig};
use fx_engine_core::portfolio::PortfolioState;
use fx_engine_core::traits::{ExitAdvisor, MarketDataProvider, Strategy};
use fx_engine_execution::ExecutionManager;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Builds the strategy for an instrument from the current configuration.
pub type StrategyFactory =
    Arc<dyn Fn(&InstrumentConfig, &EngineConfig) -> Arc<dyn Strategy> + Send + Sync>;

const COMMAND_BUFFER: usize = 32;
const RESULT_BUFFER: usize = 64;

pub struct Orchestrator {
    rx: mpsc::Receiver<EngineCommand>,
    status_tx: watch::Sender<EngineStatus>,
    results_tx: broadcast::Sender<CycleResult>,
    config_rx: watch::Receiver<SharedConfig>,
    market: Arc<dyn MarketDataProvider>,
    execution: ExecutionManager,
    strategies: StrategyFactory,
    lifecycle: PositionLifecycleManager,
    traders: Vec<InstrumentTrader>,
    /// Config version the trader set was built from; 0 before the first cycle
    traders_version: u64,
    state: EngineState,
    cycle: u64,
    /// Latched for the rest of the session once tripped
    emergency: bool,
    peak_equity: Option<Decimal>,
    next_cycle_at: Instant,
    last_cycle_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Orchestrator {
    /// Creates the actor and its first handle. Nothing runs until [`Orchestrator::run`] is polled.
    #[must_use]
    pub fn new(
        config_rx: watch::Receiver<SharedConfig>,
        market: Arc<dyn MarketDataProvider>,
        execution: ExecutionManager,
        strategies: StrategyFactory,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (results_tx, _) = broadcast::channel(RESULT_BUFFER);
        let config_version = config_rx.borrow().version;

        let orchestrator = Self {
            rx,
            status_tx: watch::Sender::new(EngineStatus {
                state: EngineState::Idle,
                cycle: 0,
                config_version,
                emergency_stop: false,
                breaker: execution.breaker_snapshot(),
                open_positions: Vec::new(),
                last_cycle_at: None,
                last_error: None,
            }),
            results_tx,
            config_rx,
            market,
            execution,
            strategies,
            lifecycle: PositionLifecycleManager::default(),
            traders: Vec::new(),
            traders_version: 0,
            state: EngineState::Idle,
            cycle: 0,
            emergency: false,
            peak_equity: None,
            next_cycle_at: Instant::now(),
            last_cycle_at: None,
            last_error: None,
        };
        orchestrator.publish_status();

        let handle = EngineHandle::new(
            tx,
            orchestrator.status_tx.subscribe(),
            orchestrator.results_tx.clone(),
        );
        (orchestrator, handle)
    }

    /// Consults `advisor` for early exits of losing positions.
    #[must_use]
    pub fn with_exit_advisor(mut self, advisor: Arc<dyn ExitAdvisor>) -> Self {
        self.lifecycle = PositionLifecycleManager::new(Some(advisor));
        self
    }

    /// Spawns the actor on the current runtime.
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Engine actor started");

        loop {
            let command = if self.state.is_scheduled() {
                tokio::select! {
                    command = self.rx.recv() => command,
                    () = tokio::time::sleep_until(self.next_cycle_at) => {
                        self.scheduled_cycle().await;
                        continue;
                    }
                }
            } else {
                self.rx.recv().await
            };

            let Some(command) = command else {
                info!("All engine handles dropped, shutting down");
                break;
            };
            if !self.handle_command(command).await {
                break;
            }
        }

        if self.state != EngineState::Stopped {
            self.state = EngineState::Stopped;
            self.publish_status();
        }
        info!(cycles = self.cycle, "Engine actor stopped");
    }

    /// Returns false when the actor should exit.
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Start => {
                if self.transition(Transition::Start) {
                    info!("Engine started");
                    self.next_cycle_at = Instant::now();
                }
            }
            EngineCommand::Pause => {
                if self.transition(Transition::Pause) {
                    info!("Engine paused");
                }
            }
            EngineCommand::Resume => {
                if self.transition(Transition::Resume) {
                    info!("Engine resumed");
                }
            }
            EngineCommand::Stop => {
                if self.transition(Transition::Stop) {
                    info!("Engine stopping");
                    self.transition(Transition::Finish);
                    info!("Engine stopped");
                }
            }
            EngineCommand::EmergencyStop(reply) => {
                if self.state == EngineState::Stopped && !self.lifecycle.is_empty() {
                    warn!("Emergency stop on a stopped engine, running close-only sweep");
                } else if self.state == EngineState::Stopped {
                    warn!(state = %self.state, "Ignoring emergency stop");
                    return true;
                }
                self.trip_emergency("operator command");
                let result = self.run_cycle().await;
                let _ = reply.send(result);
            }
            EngineCommand::RunCycle(reply) => {
                if matches!(self.state, EngineState::Stopping | EngineState::Stopped) {
                    warn!(state = %self.state, "Ignoring cycle request");
                } else {
                    let result = self.run_cycle().await;
                    let _ = reply.send(result);
                }
            }
            EngineCommand::GetStatus(reply) => {
                let _ = reply.send(self.status());
            }
            EngineCommand::Shutdown => {
                info!("Engine shutting down");
                return false;
            }
        }
        true
    }

    fn transition(&mut self, transition: Transition) -> bool {
        match self.state.apply(transition) {
            Some(next) => {
                self.state = next;
                self.publish_status();
                true
            }
            None => {
                warn!(state = %self.state, ?transition, "Ignoring invalid transition");
                false
            }
        }
    }

    async fn scheduled_cycle(&mut self) {
        let started = Instant::now();
        let interval = self.config_rx.borrow().config.engine.cycle_interval();
        self.run_cycle().await;

        let boundary = started + interval;
        let now = Instant::now();
        if now > boundary {
            warn!(
                overrun_ms = u64::try_from((now - boundary).as_millis()).unwrap_or(u64::MAX),
                "Cycle overran its interval, starting next cycle immediately"
            );
            self.next_cycle_at = now;
        } else {
            self.next_cycle_at = boundary;
        }
    }

    fn trip_emergency(&mut self, source: &str) {
        if !self.emergency {
            error!(source, "EMERGENCY STOP: blocking new exposure");
            self.emergency = true;
        }
    }

    /// Updates the session peak and trips the emergency stop on excess drawdown.
    fn check_drawdown(&mut self, equity: Decimal, limits: &PortfolioLimits) {
        let peak = self.peak_equity.map_or(equity, |p| p.max(equity));
        self.peak_equity = Some(peak);

        let Some(max_drawdown) = limits.max_drawdown_percent else {
            return;
        };
        if peak <= Decimal::ZERO {
            return;
        }
        let drawdown = (peak - equity) / peak * Decimal::ONE_HUNDRED;
        if drawdown >= max_drawdown {
            error!(%peak, %equity, %drawdown, %max_drawdown, "Drawdown limit reached");
            self.trip_emergency("drawdown guard");
        }
    }

    /// Rebuilds the trader set when the configuration version changed.
    fn sync_traders(&mut self, shared: &SharedConfig) {
        if shared.version == self.traders_version {
            return;
        }
        let config = &shared.config;
        let mut previous: HashMap<String, InstrumentTrader> = self
            .traders
            .drain(..)
            .map(|t| (t.symbol().to_string(), t))
            .collect();

        self.traders = config
            .enabled_instruments()
            .map(|instrument| {
                let strategy = (self.strategies)(instrument, config);
                match previous.remove(&instrument.symbol) {
                    Some(mut trader) => {
                        trader.reconfigure(instrument.clone(), strategy);
                        trader
                    }
                    None => InstrumentTrader::new(instrument.clone(), strategy),
                }
            })
            .collect();
        self.traders_version = shared.version;

        info!(
            version = shared.version,
            instruments = self.traders.len(),
            dropped = previous.len(),
            "Applied configuration"
        );
    }

    async fn run_cycle(&mut self) -> CycleResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let shared = self.config_rx.borrow_and_update().clone();
        let config = &shared.config;
        self.sync_traders(&shared);
        self.cycle += 1;
        let cycle = self.cycle;
        debug!(cycle, config_version = shared.version, "Cycle started");

        if config.portfolio.emergency_stop {
            self.trip_emergency("configuration");
        }

        let account = self.execution.account_state().await;
        let mut account_error = None;
        let equity = match account {
            Ok(account) => {
                self.check_drawdown(account.equity, &config.portfolio);
                Some(account.equity)
            }
            Err(e) => {
                warn!(cycle, error = %e, "Account snapshot unavailable, no trader dispatched");
                account_error = Some(e.to_string());
                None
            }
        };
        let emergency = self.emergency;

        let per_instrument = match (equity, &account_error) {
            (Some(equity), _) => {
                let snapshot =
                    PortfolioState::capture(cycle, equity, self.lifecycle.positions(), emergency);
                let gate = ApprovalGate::new(config);
                let ledger = RiskLedger::new();
                let ctx = CycleContext {
                    config,
                    gate: &gate,
                    snapshot: &snapshot,
                    ledger: &ledger,
                    market: self.market.as_ref(),
                    execution: &self.execution,
                };
                let outputs = dispatch(&mut self.traders, ctx, config.engine.workers).await;
                outputs
                    .into_iter()
                    .map(|out| {
                        if let Some(position) = out.opened {
                            self.lifecycle.track(position);
                        }
                        out.report
                    })
                    .collect()
            }
            (None, reason) => self
                .traders
                .iter()
                .map(|t| {
                    InstrumentReport::skipped(
                        t.symbol(),
                        None,
                        format!(
                            "account snapshot unavailable: {}",
                            reason.as_deref().unwrap_or_default()
                        ),
                    )
                })
                .collect(),
        };

        let prices: HashMap<String, Decimal> = self
            .traders
            .iter()
            .filter_map(|t| t.last_price().map(|p| (t.symbol().to_string(), p)))
            .collect();
        let sweep = SweepContext {
            config: &config.lifecycle,
            emergency_stop: emergency,
            liquidate_on_emergency: config.portfolio.liquidate_on_emergency,
            prices: &prices,
        };
        let lifecycle_actions = self.lifecycle.sweep(sweep, &self.execution).await;

        let equity_after = match self.execution.account_state().await {
            Ok(account) => account.equity,
            Err(_) => equity.unwrap_or_default(),
        };
        let portfolio_after =
            PortfolioState::capture(cycle, equity_after, self.lifecycle.positions(), emergency);

        let result = CycleResult {
            cycle,
            config_version: shared.version,
            started_at,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            emergency_stop: emergency,
            account_error: account_error.clone(),
            per_instrument,
            lifecycle_actions,
            portfolio_after,
        };

        info!(
            cycle,
            instruments = result.per_instrument.len(),
            orders = result.orders_filled(),
            lifecycle_actions = result.lifecycle_actions.len(),
            open_positions = result.portfolio_after.open_position_count,
            risk_percent = %result.portfolio_after.aggregate_risk_percent,
            duration_ms = result.duration_ms,
            "Cycle complete"
        );

        self.last_cycle_at = Some(started_at);
        self.last_error = account_error;
        if emergency && self.state != EngineState::Stopped {
            self.transition(Transition::Emergency);
            error!(cycle, "Engine stopped by emergency stop");
        }

        let _ = self.results_tx.send(result.clone());
        self.publish_status();
        result
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            cycle: self.cycle,
            config_version: self.config_rx.borrow().version,
            emergency_stop: self.emergency,
            breaker: self.execution.breaker_snapshot(),
            open_positions: self.lifecycle.positions().cloned().collect(),
            last_cycle_at: self.last_cycle_at,
            last_error: self.last_error.clone(),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }
}

/// Runs every trader once, at most `workers` at a time, preserving trader order.
async fn dispatch(
    traders: &mut [InstrumentTrader],
    ctx: CycleContext<'_>,
    workers: usize,
) -> Vec<TraderOutput> {
    let pending: Vec<_> = traders
        .iter_mut()
        .map(|trader| trader.run_cycle(ctx))
        .collect();
    stream::iter(pending)
        .buffered(workers.max(1))
        .collect()
        .await
}
