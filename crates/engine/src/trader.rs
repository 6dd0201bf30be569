use crate::approval::{ApprovalGate, ApprovalRequest, RejectionReason};
use crate::events::InstrumentReport;
use crate::ledger::RiskLedger;
use chrono::{DateTime, Utc};
use fx_engine_core::config::{EngineConfig, InstrumentConfig};
use fx_engine_core::error::{DataError, ErrorKind};
use fx_engine_core::events::{Bar, OrderRequest, Side, Signal};
use fx_engine_core::portfolio::PortfolioState;
use fx_engine_core::position::Position;
use fx_engine_core::position_sizing::{calculate_position_size, SizingDecision};
use fx_engine_core::traits::{MarketDataProvider, Strategy};
use fx_engine_execution::ExecutionManager;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared, read-only inputs every trader sees during one cycle.
#[derive(Clone, Copy)]
pub struct CycleContext<'a> {
    pub config: &'a EngineConfig,
    pub gate: &'a ApprovalGate,
    pub snapshot: &'a PortfolioState,
    pub ledger: &'a RiskLedger,
    pub market: &'a dyn MarketDataProvider,
    pub execution: &'a ExecutionManager,
}

#[derive(Debug)]
pub struct TraderOutput {
    pub report: InstrumentReport,
    /// Position created by a filled order, handed to the lifecycle manager
    pub opened: Option<Position>,
}

impl From<InstrumentReport> for TraderOutput {
    fn from(report: InstrumentReport) -> Self {
        Self { report, opened: None }
    }
}

/// Runs the signal → gate → size → execute pipeline for one instrument.
pub struct InstrumentTrader {
    instrument: InstrumentConfig,
    strategy: Arc<dyn Strategy>,
    last_trade_at: Option<DateTime<Utc>>,
    last_price: Option<Decimal>,
}

impl std::fmt::Debug for InstrumentTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentTrader")
            .field("instrument", &self.instrument.symbol)
            .field("strategy", &self.strategy.name())
            .field("last_trade_at", &self.last_trade_at)
            .field("last_price", &self.last_price)
            .finish()
    }
}

impl InstrumentTrader {
    #[must_use]
    pub fn new(instrument: InstrumentConfig, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            instrument,
            strategy,
            last_trade_at: None,
            last_price: None,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }

    #[must_use]
    pub const fn last_trade_at(&self) -> Option<DateTime<Utc>> {
        self.last_trade_at
    }

    /// Close of the most recent bar seen, used to price the lifecycle sweep.
    #[must_use]
    pub const fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    /// Swaps in a reloaded instrument definition and strategy; cooldown history is kept.
    pub fn reconfigure(&mut self, instrument: InstrumentConfig, strategy: Arc<dyn Strategy>) {
        self.instrument = instrument;
        self.strategy = strategy;
    }

    pub async fn run_cycle(&mut self, ctx: CycleContext<'_>) -> TraderOutput {
        let symbol = self.instrument.symbol.clone();

        let bars = match self.fetch_bars(ctx).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(instrument = %symbol, error = %e, "Market data unavailable");
                return InstrumentReport::skipped(symbol, Some(e.kind()), e.to_string()).into();
            }
        };
        if let Some(last) = bars.last() {
            self.last_price = Some(last.close);
        }

        let signal = match self.strategy.analyze(&symbol, &bars).await {
            Ok(signal) => signal,
            Err(e) => {
                warn!(instrument = %symbol, strategy = self.strategy.name(), error = %e, "Strategy failed");
                return InstrumentReport::skipped(
                    symbol,
                    Some(ErrorKind::DataUnavailable),
                    format!("strategy failed: {e:#}"),
                )
                .into();
            }
        };

        let mut report = InstrumentReport::new(symbol);
        report.signal = Some(signal.clone());

        let Some(side) = signal.direction.side() else {
            debug!(instrument = %report.instrument, reason = %signal.reason, "Hold");
            return report.into();
        };

        if signal.confidence < ctx.gate.min_confidence() {
            info!(
                instrument = %report.instrument,
                confidence = signal.confidence,
                min = ctx.gate.min_confidence(),
                reason = %RejectionReason::LowConfidence,
                "Signal rejected"
            );
            report.rejection = Some(RejectionReason::LowConfidence);
            return report.into();
        }

        let opened = self.trade(ctx, &signal, side, &mut report).await;
        TraderOutput { report, opened }
    }

    async fn fetch_bars(&self, ctx: CycleContext<'_>) -> Result<Vec<Bar>, DataError> {
        let settings = &ctx.config.engine;
        let request = ctx
            .market
            .recent_bars(&self.instrument.symbol, &settings.timeframe, settings.bars);
        let bars = tokio::time::timeout(settings.data_timeout(), request)
            .await
            .map_err(|_| DataError::Timeout {
                timeout_ms: settings.data_timeout_ms,
            })?
            .map_err(|e| DataError::Provider(format!("{e:#}")))?;
        if bars.is_empty() {
            return Err(DataError::Empty);
        }
        Ok(bars)
    }

    /// Gate, size and execute an actionable signal. Returns the opened position on a fill.
    async fn trade(
        &mut self,
        ctx: CycleContext<'_>,
        signal: &Signal,
        side: Side,
        report: &mut InstrumentReport,
    ) -> Option<Position> {
        let instrument = &self.instrument;
        let now = Utc::now();
        let request = ApprovalRequest {
            instrument: &instrument.symbol,
            side,
            risk_percent: instrument.risk_percent,
            last_trade_at: self.last_trade_at,
            now,
        };

        let mut reservation = match ctx.gate.evaluate(ctx.snapshot, ctx.ledger, &request) {
            Ok(reservation) => reservation,
            Err(reason) => {
                info!(instrument = %instrument.symbol, side = ?side, %reason, "Signal rejected");
                report.rejection = Some(reason);
                return None;
            }
        };

        let sizing = match calculate_position_size(
            ctx.snapshot.equity,
            instrument.risk_percent,
            signal.reference_price,
            signal.suggested_stop,
            &instrument.spec,
        ) {
            Ok(sizing) => sizing,
            Err(e) => {
                warn!(instrument = %instrument.symbol, error = %e, "Cannot size trade");
                report.skipped = Some(e.to_string());
                report.error_kind = Some(e.kind());
                return None;
            }
        };
        report.sizing = Some(sizing.clone());

        let SizingDecision::Trade {
            volume,
            risk_percent,
            ..
        } = sizing
        else {
            info!(instrument = %instrument.symbol, "Volume below broker minimum, no trade");
            return None;
        };
        reservation.settle(risk_percent);

        // Sizing succeeded, so the stop is present
        let stop = signal.suggested_stop?;
        let order = OrderRequest {
            instrument: instrument.symbol.clone(),
            side,
            volume,
            stop_loss: stop,
            take_profit: signal.suggested_target,
            max_slippage: instrument
                .spec
                .pips_to_price(ctx.config.execution.max_slippage_pips),
            reference_price: signal.reference_price,
            comment: signal.reason.clone(),
        };

        let outcome = ctx.execution.execute(&order).await;
        let position = match (outcome.success, outcome.ticket) {
            (true, Some(ticket)) => {
                let position = Position::open(
                    ticket,
                    order.instrument.clone(),
                    side,
                    outcome.filled_volume.unwrap_or(volume),
                    outcome.filled_price.unwrap_or(signal.reference_price),
                    Some(stop),
                    order.take_profit,
                    instrument.spec.clone(),
                );
                // Equity is positive here, sizing rejects anything else
                let realised = position
                    .risk_amount()
                    .map_or(risk_percent, |amount| amount / ctx.snapshot.equity * Decimal::ONE_HUNDRED);
                reservation.commit_filled(realised);
                self.last_trade_at = Some(now);
                info!(
                    instrument = %order.instrument,
                    ticket,
                    side = ?side,
                    volume = %position.volume,
                    price = %position.entry_price,
                    risk_percent = %realised,
                    "Position opened"
                );
                Some(position)
            }
            _ => {
                warn!(
                    instrument = %order.instrument,
                    error_kind = ?outcome.error_kind,
                    code = ?outcome.broker_error_code,
                    attempts = outcome.attempts,
                    message = ?outcome.message,
                    "Order failed"
                );
                report.error_kind = outcome.error_kind;
                None
            }
        };
        report.outcome = Some(outcome);
        position
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use fx_engine_core::config::InstrumentSpec;
    use fx_engine_core::error::BrokerError;
    use fx_engine_core::events::SignalDirection;
    use fx_engine_execution::PaperBroker;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    pub(crate) fn eurusd() -> InstrumentConfig {
        InstrumentConfig {
            symbol: "EURUSD".to_string(),
            enabled: true,
            risk_percent: dec!(1),
            spec: InstrumentSpec {
                pip_size: dec!(0.0001),
                pip_value_per_lot: dec!(10),
                volume_step: dec!(0.01),
                volume_min: dec!(0.01),
                volume_max: dec!(100),
            },
        }
    }

    /// Flat market at 1.1000 for any instrument.
    pub(crate) struct FlatMarket {
        pub delay: Option<Duration>,
    }

    #[async_trait]
    impl MarketDataProvider for FlatMarket {
        async fn recent_bars(&self, _instrument: &str, _timeframe: &str, count: usize) -> Result<Vec<Bar>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let bar = Bar {
                time: Utc::now(),
                open: dec!(1.1000),
                high: dec!(1.1005),
                low: dec!(1.0995),
                close: dec!(1.1000),
                volume: dec!(100),
            };
            Ok(vec![bar; count])
        }
    }

    /// Emits the same signal every cycle: 50-pip stop, 100-pip target.
    pub(crate) struct FixedSignal {
        pub direction: SignalDirection,
        pub confidence: f64,
        pub with_stop: bool,
    }

    #[async_trait]
    impl Strategy for FixedSignal {
        async fn analyze(&self, instrument: &str, bars: &[Bar]) -> Result<Signal> {
            let price = bars.last().map_or(dec!(1.1000), |b| b.close);
            if self.direction == SignalDirection::Hold {
                return Ok(Signal::hold(instrument, price, "flat"));
            }
            let sign = if self.direction == SignalDirection::Buy { dec!(1) } else { dec!(-1) };
            let signal = Signal::new(instrument, self.direction, self.confidence, price, "fixed")?
                .with_target(price + sign * dec!(0.0100));
            Ok(if self.with_stop {
                signal.with_stop(price - sign * dec!(0.0050))
            } else {
                signal
            })
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    pub(crate) fn fixed(direction: SignalDirection, confidence: f64) -> Arc<dyn Strategy> {
        Arc::new(FixedSignal {
            direction,
            confidence,
            with_stop: true,
        })
    }

    struct Fixture {
        config: EngineConfig,
        broker: PaperBroker,
        execution: ExecutionManager,
        market: FlatMarket,
        ledger: RiskLedger,
    }

    impl Fixture {
        fn new() -> Self {
            let mut config = EngineConfig::default();
            config.instruments = vec![eurusd()];
            config.execution.max_retries = 0;
            config.approval.min_confidence = 0.5;
            let broker = PaperBroker::new(dec!(10000));
            broker.register_instrument("EURUSD", eurusd().spec);
            broker.mark_price("EURUSD", dec!(1.1000));
            let execution = ExecutionManager::new(Box::new(broker.clone()), &config.execution);
            Self {
                config,
                broker,
                execution,
                market: FlatMarket { delay: None },
                ledger: RiskLedger::new(),
            }
        }

        async fn run(&self, trader: &mut InstrumentTrader, snapshot: &PortfolioState) -> TraderOutput {
            let gate = ApprovalGate::new(&self.config);
            let ctx = CycleContext {
                config: &self.config,
                gate: &gate,
                snapshot,
                ledger: &self.ledger,
                market: &self.market,
                execution: &self.execution,
            };
            trader.run_cycle(ctx).await
        }
    }

    fn empty_snapshot() -> PortfolioState {
        PortfolioState::capture(1, dec!(10000), std::iter::empty(), false)
    }

    #[tokio::test]
    async fn approved_signal_opens_sized_position() {
        let fx = Fixture::new();
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        assert!(out.report.opened_position());
        assert_eq!(out.report.sizing.as_ref().and_then(SizingDecision::volume), Some(dec!(0.20)));
        let position = out.opened.unwrap();
        assert_eq!(position.volume, dec!(0.20));
        assert_eq!(position.current_stop, Some(dec!(1.0950)));
        assert_eq!(position.stack_group, "EURUSD:Buy");
        assert_eq!(fx.broker.open_position_count(), 1);
        assert_eq!(fx.ledger.totals().count, 1);
        assert_eq!(fx.ledger.totals().risk_percent, dec!(1));
        assert!(trader.last_trade_at().is_some());
        assert_eq!(trader.last_price(), Some(dec!(1.1000)));
    }

    #[tokio::test]
    async fn ledger_carries_risk_of_slipped_fill() {
        let fx = Fixture::new();
        fx.broker.mark_price("EURUSD", dec!(1.1002));
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        let position = out.opened.unwrap();
        assert_eq!(position.entry_price, dec!(1.1002));
        assert_eq!(position.volume, dec!(0.20));
        // 52 pips x 0.20 lots x 10 = 104 on 10000
        assert_eq!(fx.ledger.totals().risk_percent, dec!(1.04));
        let after = PortfolioState::capture(2, dec!(10000), [&position].into_iter(), false);
        assert_eq!(after.aggregate_risk_percent, fx.ledger.totals().risk_percent);
    }

    #[tokio::test]
    async fn hold_ends_cycle_without_rejection() {
        let fx = Fixture::new();
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Hold, 0.0));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        assert!(out.report.signal.as_ref().unwrap().is_hold());
        assert!(out.report.rejection.is_none());
        assert!(out.report.outcome.is_none());
        assert_eq!(fx.broker.call_count(), 0);
    }

    #[tokio::test]
    async fn low_confidence_is_rejected_before_the_gate() {
        let fx = Fixture::new();
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.2));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        assert_eq!(out.report.rejection, Some(RejectionReason::LowConfidence));
        assert_eq!(fx.ledger.totals().count, 0);
        assert_eq!(fx.broker.call_count(), 0);
    }

    #[tokio::test]
    async fn stacking_rejection_sends_no_order() {
        let fx = Fixture::new();
        let existing = Position::open(
            7,
            "EURUSD",
            Side::Buy,
            dec!(0.1),
            dec!(1.0990),
            Some(dec!(1.0940)),
            None,
            eurusd().spec,
        );
        let snapshot = PortfolioState::capture(1, dec!(10000), [&existing], false);
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &snapshot).await;

        assert_eq!(out.report.rejection, Some(RejectionReason::StackingDisallowed));
        assert!(out.report.sizing.is_none());
        assert!(out.opened.is_none());
        assert_eq!(fx.broker.call_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_applies_after_own_trade() {
        let mut fx = Fixture::new();
        fx.config.approval.allow_stacking = true;
        fx.config.approval.max_per_direction = 5;
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        assert!(fx.run(&mut trader, &empty_snapshot()).await.opened.is_some());
        let again = fx.run(&mut trader, &empty_snapshot()).await;
        assert_eq!(again.report.rejection, Some(RejectionReason::Cooldown));
    }

    #[tokio::test]
    async fn missing_stop_is_invalid_risk_input_and_releases_reservation() {
        let fx = Fixture::new();
        let strategy = Arc::new(FixedSignal {
            direction: SignalDirection::Sell,
            confidence: 0.9,
            with_stop: false,
        });
        let mut trader = InstrumentTrader::new(eurusd(), strategy);

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        assert_eq!(out.report.error_kind, Some(ErrorKind::InvalidRiskInput));
        assert!(out.report.skipped.is_some());
        assert_eq!(fx.ledger.totals().count, 0);
        assert_eq!(fx.broker.call_count(), 0);
    }

    #[tokio::test]
    async fn tiny_equity_sizes_to_no_trade() {
        let fx = Fixture::new();
        let snapshot = PortfolioState::capture(1, dec!(10), std::iter::empty(), false);
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &snapshot).await;

        assert!(matches!(out.report.sizing, Some(SizingDecision::NoTrade { .. })));
        assert!(out.report.outcome.is_none());
        assert_eq!(fx.ledger.totals().count, 0);
    }

    #[tokio::test]
    async fn broker_failure_is_reported_and_releases_reservation() {
        let fx = Fixture::new();
        fx.broker.inject_failure(BrokerError::MarketClosed);
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        let outcome = out.report.outcome.as_ref().unwrap();
        assert!(!outcome.success);
        assert_eq!(out.report.error_kind, Some(ErrorKind::PermanentBrokerError));
        assert!(out.opened.is_none());
        assert!(trader.last_trade_at().is_none());
        assert_eq!(fx.ledger.totals().count, 0);
    }

    #[tokio::test]
    async fn slow_market_data_times_out() {
        let mut fx = Fixture::new();
        fx.config.engine.data_timeout_ms = 20;
        fx.market = FlatMarket {
            delay: Some(Duration::from_millis(200)),
        };
        let mut trader = InstrumentTrader::new(eurusd(), fixed(SignalDirection::Buy, 0.9));

        let out = fx.run(&mut trader, &empty_snapshot()).await;

        assert_eq!(out.report.error_kind, Some(ErrorKind::DataUnavailable));
        assert!(out.report.skipped.unwrap().contains("timed out"));
        assert!(out.report.signal.is_none());
    }
}
