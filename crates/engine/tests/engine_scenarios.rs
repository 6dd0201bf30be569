//! End-to-end cycles through the engine actor against the paper broker.
//!
//! Covers the stacking rejection path, emergency containment, portfolio caps
//! under parallel traders, broker call serialization, circuit breaker
//! fail-fast inside a cycle, config reloads, the drawdown guard, early exits,
//! cycle overruns and account snapshot failures.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use fx_engine_core::config::{ConfigSnapshot, EngineConfig, InstrumentConfig, InstrumentSpec, SharedConfig};
use fx_engine_core::error::{BrokerError, ErrorKind};
use fx_engine_core::events::{AccountState, Bar, BrokerFill, OrderRequest, Signal, SignalDirection, Ticket};
use fx_engine_core::position::Position;
use fx_engine_core::traits::{BrokerConnector, ExitAdvisor, MarketDataProvider, Strategy};
use fx_engine_execution::{BreakerState, ExecutionManager, PaperBroker};
use fx_engine_orchestrator::{
    CycleResult, EngineHandle, EngineState, LifecycleActionKind, Orchestrator, RejectionReason,
    StrategyFactory,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// =============================================================================
// Helper Functions
// =============================================================================

const MAJORS: [&str; 6] = ["EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDCAD", "USDCHF"];

fn spec() -> InstrumentSpec {
    InstrumentSpec {
        pip_size: dec!(0.0001),
        pip_value_per_lot: dec!(10),
        volume_step: dec!(0.01),
        volume_min: dec!(0.01),
        volume_max: dec!(100),
    }
}

fn instrument(symbol: &str) -> InstrumentConfig {
    InstrumentConfig {
        symbol: symbol.to_string(),
        enabled: true,
        risk_percent: dec!(1),
        spec: spec(),
    }
}

fn config(symbols: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.instruments = symbols.iter().map(|s| instrument(s)).collect();
    config.approval.cooldown_secs = 0;
    config.execution.max_retries = 0;
    config.execution.base_backoff_ms = 1;
    config.execution.max_backoff_ms = 1;
    config
}

/// Market whose prices are set by the test; every price is also marked on the paper broker.
struct ScriptedMarket {
    broker: PaperBroker,
    prices: Mutex<HashMap<String, Decimal>>,
    latency: Mutex<Duration>,
}

impl ScriptedMarket {
    fn new(broker: PaperBroker) -> Self {
        Self {
            broker,
            prices: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn set(&self, symbol: &str, price: Decimal) {
        self.prices.lock().insert(symbol.to_string(), price);
        self.broker.mark_price(symbol, price);
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedMarket {
    async fn recent_bars(&self, instrument: &str, _timeframe: &str, count: usize) -> Result<Vec<Bar>> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let price = self
            .prices
            .lock()
            .get(instrument)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no price for {instrument}"))?;
        let bar = Bar {
            time: Utc::now(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(100),
        };
        Ok(vec![bar; count])
    }
}

/// Buys every cycle with a 50-pip stop and a 100-pip target.
struct AlwaysBuy;

#[async_trait]
impl Strategy for AlwaysBuy {
    async fn analyze(&self, instrument: &str, bars: &[Bar]) -> Result<Signal> {
        let price = bars.last().map_or(Decimal::ZERO, |b| b.close);
        Ok(Signal::new(instrument, SignalDirection::Buy, 0.9, price, "always buy")?
            .with_stop(price - dec!(0.0050))
            .with_target(price + dec!(0.0100)))
    }

    fn name(&self) -> &'static str {
        "always buy"
    }
}

fn always_buy() -> StrategyFactory {
    Arc::new(|_: &InstrumentConfig, _: &EngineConfig| Arc::new(AlwaysBuy) as Arc<dyn Strategy>)
}

struct Session {
    broker: PaperBroker,
    market: Arc<ScriptedMarket>,
    config_tx: watch::Sender<SharedConfig>,
    handle: EngineHandle,
}

impl Session {
    fn start(config: EngineConfig) -> Self {
        let broker = PaperBroker::new(dec!(10000));
        Self::build(config, broker.clone(), Box::new(broker), None)
    }

    fn with_connector(config: EngineConfig, broker: PaperBroker, connector: Box<dyn BrokerConnector>) -> Self {
        Self::build(config, broker, connector, None)
    }

    fn with_advisor(config: EngineConfig, advisor: Arc<dyn ExitAdvisor>) -> Self {
        let broker = PaperBroker::new(dec!(10000));
        Self::build(config, broker.clone(), Box::new(broker), Some(advisor))
    }

    fn build(
        config: EngineConfig,
        broker: PaperBroker,
        connector: Box<dyn BrokerConnector>,
        advisor: Option<Arc<dyn ExitAdvisor>>,
    ) -> Self {
        let market = Arc::new(ScriptedMarket::new(broker.clone()));
        for instrument in &config.instruments {
            broker.register_instrument(instrument.symbol.clone(), instrument.spec.clone());
            market.set(&instrument.symbol, dec!(1.1000));
        }

        let execution = ExecutionManager::new(connector, &config.execution);
        let (config_tx, config_rx) = watch::channel(ConfigSnapshot::shared(1, config));
        let (mut orchestrator, handle) =
            Orchestrator::new(config_rx, market.clone(), execution, always_buy());
        if let Some(advisor) = advisor {
            orchestrator = orchestrator.with_exit_advisor(advisor);
        }
        orchestrator.spawn();

        Self {
            broker,
            market,
            config_tx,
            handle,
        }
    }

    async fn cycle(&self) -> CycleResult {
        self.handle.run_cycle().await.unwrap()
    }
}

fn rejections(result: &CycleResult) -> Vec<Option<RejectionReason>> {
    result.per_instrument.iter().map(|r| r.rejection).collect()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn same_direction_signal_is_rejected_without_order_when_stacking_disabled() {
    let session = Session::start(config(&["EURUSD"]));

    let first = session.cycle().await;
    assert_eq!(first.orders_filled(), 1);
    assert_eq!(first.portfolio_after.open_position_count, 1);

    let second = session.cycle().await;
    let report = second.report("EURUSD").unwrap();
    assert_eq!(report.rejection, Some(RejectionReason::StackingDisallowed));
    assert!(report.sizing.is_none());
    assert!(report.outcome.is_none());
    assert_eq!(session.broker.open_position_count(), 1);
}

#[tokio::test]
async fn opened_position_is_sized_from_equity_and_stop() {
    let session = Session::start(config(&["EURUSD"]));

    let result = session.cycle().await;

    let report = result.report("EURUSD").unwrap();
    assert_eq!(report.outcome.as_ref().unwrap().filled_volume, Some(dec!(0.20)));
    assert_eq!(result.portfolio_after.aggregate_risk_percent, dec!(1));
    let status = session.handle.status().await.unwrap();
    assert_eq!(status.open_positions.len(), 1);
    assert_eq!(status.open_positions[0].stack_group, "EURUSD:Buy");
}

#[tokio::test]
async fn emergency_stop_blocks_exposure_and_stop_moves() {
    let session = Session::start(config(&["EURUSD", "GBPUSD"]));

    let opened = session.cycle().await;
    assert_eq!(opened.orders_filled(), 2);

    // 30 pips in profit: breakeven would fire outside an emergency
    session.market.set("EURUSD", dec!(1.1030));
    let result = session.handle.emergency_stop().await.unwrap();

    assert!(result.emergency_stop);
    assert_eq!(
        rejections(&result),
        vec![Some(RejectionReason::EmergencyStop); 2]
    );
    assert!(result.per_instrument.iter().all(|r| r.outcome.is_none()));
    assert!(result.lifecycle_actions.iter().all(|a| !matches!(
        a.action,
        LifecycleActionKind::Breakeven { .. } | LifecycleActionKind::Trail { .. }
    )));
    assert_eq!(session.broker.open_position_count(), 2);

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.state, EngineState::Stopped);
    assert!(status.emergency_stop);
    assert!(status
        .open_positions
        .iter()
        .all(|p| p.current_stop == Some(dec!(1.0950))));
    assert!(session.handle.run_cycle().await.is_err());
}

#[tokio::test]
async fn emergency_liquidation_closes_every_position() {
    let mut cfg = config(&["EURUSD", "GBPUSD", "AUDUSD"]);
    cfg.portfolio.liquidate_on_emergency = true;
    let session = Session::start(cfg);

    assert_eq!(session.cycle().await.orders_filled(), 3);
    let result = session.handle.emergency_stop().await.unwrap();

    let closes: Vec<_> = result
        .lifecycle_actions
        .iter()
        .filter(|a| a.action == LifecycleActionKind::EmergencyClose)
        .collect();
    assert_eq!(closes.len(), 3);
    assert!(closes.iter().all(|a| a.succeeded()));
    assert_eq!(result.portfolio_after.open_position_count, 0);
    assert_eq!(session.broker.open_position_count(), 0);
}

#[tokio::test]
async fn emergency_flag_in_config_takes_effect_next_cycle() {
    let session = Session::start(config(&["EURUSD"]));
    let mut cfg = config(&["EURUSD"]);
    cfg.portfolio.emergency_stop = true;
    session.config_tx.send(ConfigSnapshot::shared(2, cfg)).unwrap();

    let result = session.cycle().await;

    assert!(result.emergency_stop);
    assert_eq!(rejections(&result), vec![Some(RejectionReason::EmergencyStop)]);
    assert_eq!(session.broker.open_position_count(), 0);
    assert_eq!(session.handle.latest_status().state, EngineState::Stopped);
}

#[tokio::test]
async fn parallel_traders_never_exceed_concurrent_trade_cap() {
    let mut cfg = config(&MAJORS);
    cfg.engine.workers = 4;
    cfg.portfolio.max_concurrent_trades = 3;
    let session = Session::start(cfg);

    let result = session.cycle().await;

    assert_eq!(result.orders_filled(), 3);
    let capped = rejections(&result)
        .into_iter()
        .filter(|r| *r == Some(RejectionReason::MaxConcurrentTrades))
        .count();
    assert_eq!(capped, 3);
    assert_eq!(session.broker.open_position_count(), 3);
    assert!(result.portfolio_after.open_position_count <= 3);
}

#[tokio::test]
async fn parallel_traders_never_exceed_risk_cap() {
    let mut cfg = config(&MAJORS);
    cfg.engine.workers = 6;
    cfg.portfolio.max_concurrent_trades = 10;
    cfg.portfolio.max_risk_percent = dec!(2.5);
    let session = Session::start(cfg);

    let result = session.cycle().await;

    assert_eq!(result.orders_filled(), 2);
    assert!(result.portfolio_after.aggregate_risk_percent <= dec!(2.5));
    let capped = rejections(&result)
        .into_iter()
        .filter(|r| *r == Some(RejectionReason::PortfolioRiskCap))
        .count();
    assert_eq!(capped, 4);
}

/// Paper broker that records whether two connector calls ever overlap.
struct OverlapDetector {
    inner: PaperBroker,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl OverlapDetector {
    async fn enter(&self) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn leave(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerConnector for OverlapDetector {
    async fn submit_order(&mut self, order: &OrderRequest) -> Result<BrokerFill, BrokerError> {
        self.enter().await;
        let result = self.inner.submit_order(order).await;
        self.leave();
        result
    }

    async fn close_position(&mut self, ticket: Ticket, volume: Option<Decimal>) -> Result<BrokerFill, BrokerError> {
        self.enter().await;
        let result = self.inner.close_position(ticket, volume).await;
        self.leave();
        result
    }

    async fn modify_position(
        &mut self,
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        self.enter().await;
        let result = self.inner.modify_position(ticket, stop, target).await;
        self.leave();
        result
    }

    async fn account_state(&mut self) -> Result<AccountState, BrokerError> {
        self.enter().await;
        let result = self.inner.account_state().await;
        self.leave();
        result
    }

    async fn open_tickets(&mut self) -> Result<Vec<Ticket>, BrokerError> {
        self.enter().await;
        let result = self.inner.open_tickets().await;
        self.leave();
        result
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_traders_and_sweep_never_overlap_broker_calls() {
    let mut cfg = config(&MAJORS);
    cfg.engine.workers = 6;
    cfg.portfolio.max_concurrent_trades = 10;
    cfg.portfolio.max_risk_percent = dec!(10);
    cfg.lifecycle.partial_close.enabled = true;
    let broker = PaperBroker::new(dec!(10000));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let detector = OverlapDetector {
        inner: broker.clone(),
        in_flight: Arc::new(AtomicBool::new(false)),
        overlaps: overlaps.clone(),
        calls: calls.clone(),
    };
    let session = Session::with_connector(cfg, broker, Box::new(detector));

    let opened = session.cycle().await;
    assert_eq!(opened.orders_filled(), 6);

    // 45 pips in profit: breakeven, trailing and partial close for every position
    for symbol in MAJORS {
        session.market.set(symbol, dec!(1.1045));
    }
    let managed = session.cycle().await;
    assert!(managed.lifecycle_actions.len() >= 12);

    assert!(calls.load(Ordering::SeqCst) >= 20);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn open_circuit_fails_fast_for_remaining_instruments() {
    let mut cfg = config(&["EURUSD", "GBPUSD", "AUDUSD"]);
    cfg.execution.failure_threshold = 2;
    cfg.execution.recovery_timeout_secs = 600;
    let session = Session::start(cfg);
    session.broker.inject_failure(BrokerError::Timeout);
    session.broker.inject_failure(BrokerError::Timeout);

    let result = session.cycle().await;

    let kinds: Vec<_> = result
        .per_instrument
        .iter()
        .map(|r| r.outcome.as_ref().and_then(|o| o.error_kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some(ErrorKind::TransientBrokerError),
            Some(ErrorKind::TransientBrokerError),
            Some(ErrorKind::CircuitOpen),
        ]
    );
    assert_eq!(result.report("AUDUSD").unwrap().outcome.as_ref().unwrap().attempts, 0);
    assert_eq!(session.broker.open_position_count(), 0);

    let status = session.handle.status().await.unwrap();
    assert_eq!(status.breaker.state, BreakerState::Open);
}

#[tokio::test]
async fn reloaded_config_adds_and_removes_traders() {
    let session = Session::start(config(&["EURUSD", "GBPUSD"]));
    session.broker.register_instrument("AUDUSD", spec());
    session.market.set("AUDUSD", dec!(1.1000));

    let first = session.cycle().await;
    assert_eq!(first.config_version, 1);
    assert_eq!(first.per_instrument.len(), 2);

    let mut cfg = config(&["EURUSD", "AUDUSD"]);
    cfg.portfolio.max_concurrent_trades = 10;
    session.config_tx.send(ConfigSnapshot::shared(2, cfg)).unwrap();

    let second = session.cycle().await;
    assert_eq!(second.config_version, 2);
    let symbols: Vec<_> = second.per_instrument.iter().map(|r| r.instrument.as_str()).collect();
    assert_eq!(symbols, vec!["EURUSD", "AUDUSD"]);
    assert!(second.report("AUDUSD").unwrap().opened_position());
    assert_eq!(
        second.report("EURUSD").unwrap().rejection,
        Some(RejectionReason::StackingDisallowed)
    );
}

#[tokio::test]
async fn drawdown_guard_trips_emergency_stop() {
    let mut cfg = config(&["EURUSD"]);
    cfg.portfolio.max_drawdown_percent = Some(dec!(0.5));
    let session = Session::start(cfg);

    assert_eq!(session.cycle().await.orders_filled(), 1);

    // 30 pips against 0.2 lots: $60, 0.6% below the 10k peak
    session.market.set("EURUSD", dec!(1.0970));
    let result = session.cycle().await;

    assert!(result.emergency_stop);
    assert_eq!(rejections(&result), vec![Some(RejectionReason::EmergencyStop)]);
    assert_eq!(session.handle.latest_status().state, EngineState::Stopped);
}

/// Rates every losing position as unlikely to recover.
struct Pessimist;

#[async_trait]
impl ExitAdvisor for Pessimist {
    async fn profit_probability(&self, _position: &Position, _price: Decimal) -> Result<Option<f64>> {
        Ok(Some(0.1))
    }
}

#[tokio::test]
async fn exit_advisor_closes_losing_position_early() {
    let mut cfg = config(&["EURUSD"]);
    cfg.lifecycle.ai_close.enabled = true;
    cfg.lifecycle.ai_close.min_profit_probability = 0.3;
    let session = Session::with_advisor(cfg, Arc::new(Pessimist));

    assert_eq!(session.cycle().await.orders_filled(), 1);

    // 20 pips against, stop not reached
    session.market.set("EURUSD", dec!(1.0980));
    let result = session.cycle().await;

    assert_eq!(result.lifecycle_actions.len(), 1);
    let action = &result.lifecycle_actions[0];
    assert_eq!(action.action, LifecycleActionKind::EarlyClose { probability: 0.1 });
    assert!(action.succeeded());
    assert_eq!(result.portfolio_after.open_position_count, 0);
    assert_eq!(session.broker.open_position_count(), 0);
}

#[tokio::test]
async fn overrunning_cycle_starts_next_immediately() {
    let mut cfg = config(&["EURUSD"]);
    cfg.engine.cycle_interval_secs = 1;
    let session = Session::start(cfg);
    session.market.set_latency(Duration::from_millis(1300));
    let mut results = session.handle.subscribe();

    session.handle.start().await.unwrap();
    let mut arrivals = Vec::new();
    for _ in 0..3 {
        let result = results.recv().await.unwrap();
        arrivals.push((result.cycle, Instant::now()));
    }
    session.handle.stop().await.unwrap();

    let cycles: Vec<_> = arrivals.iter().map(|(cycle, _)| *cycle).collect();
    assert_eq!(cycles, vec![1, 2, 3]);
    for pair in arrivals.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        // One slow cycle, with no wait for the next interval boundary
        assert!(gap >= Duration::from_millis(1300), "gap {gap:?}");
        assert!(gap < Duration::from_millis(2000), "gap {gap:?}");
    }
}

/// Paper broker whose account endpoint is down.
struct AccountDown(PaperBroker);

#[async_trait]
impl BrokerConnector for AccountDown {
    async fn submit_order(&mut self, order: &OrderRequest) -> Result<BrokerFill, BrokerError> {
        self.0.submit_order(order).await
    }

    async fn close_position(&mut self, ticket: Ticket, volume: Option<Decimal>) -> Result<BrokerFill, BrokerError> {
        self.0.close_position(ticket, volume).await
    }

    async fn modify_position(
        &mut self,
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        self.0.modify_position(ticket, stop, target).await
    }

    async fn account_state(&mut self) -> Result<AccountState, BrokerError> {
        Err(BrokerError::ConnectionLost)
    }

    async fn open_tickets(&mut self) -> Result<Vec<Ticket>, BrokerError> {
        self.0.open_tickets().await
    }
}

#[tokio::test]
async fn unavailable_account_skips_traders_but_still_sweeps() {
    let broker = PaperBroker::new(dec!(10000));
    let session = Session::with_connector(
        config(&["EURUSD", "GBPUSD"]),
        broker.clone(),
        Box::new(AccountDown(broker)),
    );

    let result = session.cycle().await;

    assert!(result.account_error.is_some());
    assert!(result
        .per_instrument
        .iter()
        .all(|r| r.skipped.is_some() && r.outcome.is_none()));
    assert_eq!(session.broker.open_position_count(), 0);
    let status = session.handle.status().await.unwrap();
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn handle_drives_state_machine() {
    let session = Session::start(config(&["EURUSD"]));
    let mut results = session.handle.subscribe();
    assert_eq!(session.handle.latest_status().state, EngineState::Idle);

    session.handle.start().await.unwrap();
    let first = results.recv().await.unwrap();
    assert_eq!(first.cycle, 1);

    session.handle.pause().await.unwrap();
    assert_eq!(session.handle.status().await.unwrap().state, EngineState::Paused);

    session.handle.resume().await.unwrap();
    assert_eq!(session.handle.status().await.unwrap().state, EngineState::Running);

    session.handle.stop().await.unwrap();
    let status = session.handle.status().await.unwrap();
    assert_eq!(status.state, EngineState::Stopped);
    assert!(status.cycle >= 1);

    session.handle.shutdown().await.unwrap();
}
