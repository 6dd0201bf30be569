//! Paper trading session against the random-walk market.

use crate::simulated::RandomWalkMarket;
use anyhow::{Context, Result};
use clap::Args;
use fx_engine_core::config::{EngineConfig, InstrumentConfig};
use fx_engine_core::traits::Strategy;
use fx_engine_core::{ConfigLoader, ConfigWatcher};
use fx_engine_execution::{ExecutionManager, PaperBroker};
use fx_engine_orchestrator::{CycleResult, EngineHandle, EngineState, Orchestrator, StrategyFactory};
use fx_engine_strategy::{EnhancedStrategy, MaCrossoverStrategy, MomentumPredictor, StopDistanceAdvisor};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Move that gives the momentum model full confidence, in pips.
const MOMENTUM_FULL_SCALE_PIPS: i64 = 50;

/// Arguments for the run command.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Engine configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config/engine.toml")]
    pub config: PathBuf,

    /// Run this many cycles back to back, then stop. Without it, cycles follow
    /// the configured interval until Ctrl+C.
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Starting paper balance
    #[arg(long, default_value = "10000")]
    pub balance: Decimal,

    /// Largest bar-to-bar move of the simulated market, in pips
    #[arg(long, default_value_t = 8)]
    pub volatility_pips: i64,

    /// Seed for a reproducible simulated market
    #[arg(long, env = "FX_SIM_SEED")]
    pub seed: Option<u64>,

    /// Print every cycle result as a JSON line on stdout
    #[arg(long)]
    pub json: bool,
}

/// Builds the crossover strategy, wrapped with the momentum model when blending is enabled.
fn strategy_factory() -> StrategyFactory {
    Arc::new(|instrument: &InstrumentConfig, config: &EngineConfig| {
        let technical = MaCrossoverStrategy::new(&config.strategy);
        if config.strategy.blend.enabled {
            let full_scale = instrument
                .spec
                .pips_to_price(Decimal::from(MOMENTUM_FULL_SCALE_PIPS));
            let predictor = MomentumPredictor::new(config.strategy.fast_period, full_scale);
            Arc::new(EnhancedStrategy::new(
                technical,
                predictor,
                config.strategy.blend.clone(),
            )) as Arc<dyn Strategy>
        } else {
            Arc::new(technical) as Arc<dyn Strategy>
        }
    })
}

/// Runs a paper session.
///
/// # Errors
/// Returns an error if the configuration cannot be loaded or the engine exits unexpectedly.
pub async fn run_session(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load(&args.config)?;
    tracing::info!(
        config = %args.config.display(),
        instruments = config.enabled_instruments().count(),
        workers = config.engine.workers,
        interval_secs = config.engine.cycle_interval_secs,
        "Starting paper session"
    );

    let broker = PaperBroker::new(args.balance);
    let market = Arc::new(RandomWalkMarket::new(broker.clone(), args.volatility_pips, args.seed));
    let warmup = MaCrossoverStrategy::new(&config.strategy)
        .warmup()
        .max(config.engine.bars);
    for instrument in &config.instruments {
        broker.register_instrument(instrument.symbol.clone(), instrument.spec.clone());
        market.register(&instrument.symbol, instrument.spec.clone(), warmup);
    }

    let execution = ExecutionManager::new(Box::new(broker.clone()), &config.execution);
    if config.lifecycle.ai_close.enabled {
        tracing::info!(
            threshold = config.lifecycle.ai_close.min_profit_probability,
            "Early close advisor enabled"
        );
    }
    let (watcher, config_rx) = ConfigWatcher::new(&args.config, config);
    tokio::spawn(async move {
        if let Err(e) = watcher.watch().await {
            tracing::error!("Config watcher stopped: {:#}", e);
        }
    });

    // Consulted only while `lifecycle.ai_close.enabled` is set
    let (orchestrator, handle) = Orchestrator::new(config_rx, market, execution, strategy_factory());
    let actor = orchestrator
        .with_exit_advisor(Arc::new(StopDistanceAdvisor))
        .spawn();

    let outcome = match args.cycles {
        Some(cycles) => run_cycles(&handle, cycles, args.json).await,
        None => run_scheduled(&handle, args.json).await,
    };

    let status = handle.status().await?;
    tracing::info!(
        state = %status.state,
        cycles = status.cycle,
        open_positions = status.open_positions.len(),
        breaker = %status.breaker.state,
        balance = %broker.balance(),
        equity = %broker.equity(),
        "Session finished"
    );
    if args.json {
        println!("{}", serde_json::to_string(&status)?);
    }

    handle.shutdown().await?;
    actor.await.context("Engine actor panicked")?;
    outcome
}

async fn run_cycles(handle: &EngineHandle, cycles: u64, json: bool) -> Result<()> {
    for _ in 0..cycles {
        let result = tokio::select! {
            result = handle.run_cycle() => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        };
        print_cycle(&result, json)?;
        if result.emergency_stop {
            tracing::warn!(cycle = result.cycle, "Emergency stop active, ending session");
            break;
        }
    }
    Ok(())
}

async fn run_scheduled(handle: &EngineHandle, json: bool) -> Result<()> {
    let mut results = handle.subscribe();
    handle.start().await?;

    loop {
        tokio::select! {
            received = results.recv() => match received {
                Ok(result) => {
                    print_cycle(&result, json)?;
                    if handle.latest_status().state == EngineState::Stopped {
                        tracing::warn!(cycle = result.cycle, "Engine stopped, ending session");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind, cycle results dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    handle.stop().await
}

fn print_cycle(result: &CycleResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    println!(
        "cycle {:>4} | filled {} | lifecycle {} | open {} | risk {}% | {}ms{}",
        result.cycle,
        result.orders_filled(),
        result.lifecycle_actions.len(),
        result.portfolio_after.open_position_count,
        result.portfolio_after.aggregate_risk_percent.round_dp(2),
        result.duration_ms,
        if result.emergency_stop { " | EMERGENCY" } else { "" },
    );
    for report in &result.per_instrument {
        let verdict = match (&report.rejection, &report.outcome, &report.skipped) {
            (Some(reason), _, _) => format!("rejected: {reason}"),
            (_, Some(outcome), _) if outcome.success => format!(
                "filled #{} at {}",
                outcome.ticket.unwrap_or_default(),
                outcome.filled_price.unwrap_or_default()
            ),
            (_, Some(outcome), _) => format!(
                "failed: {}",
                outcome.message.as_deref().unwrap_or("unknown error")
            ),
            (_, _, Some(reason)) => format!("skipped: {reason}"),
            _ => match &report.signal {
                Some(signal) if !signal.is_hold() => format!("{:?} sized to no trade", signal.direction),
                _ => "hold".to_string(),
            },
        };
        println!("    {:<8} {verdict}", report.instrument);
    }
    for action in &result.lifecycle_actions {
        println!(
            "    #{:<6} {:<8} {:?}{}",
            action.ticket,
            action.instrument,
            action.action,
            if action.succeeded() { "" } else { " (failed)" }
        );
    }
    Ok(())
}
