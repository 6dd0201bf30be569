use anyhow::Result;
use clap::Args;
use fx_engine_core::ConfigLoader;
use std::path::PathBuf;

/// Arguments for the check-config command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfigArgs {
    /// Engine configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config/engine.toml")]
    pub config: PathBuf,
}

/// Loads and validates a configuration file and prints what it enables.
///
/// # Errors
/// Returns an error listing every problem if the file is missing, unparsable or invalid.
pub fn run_check_config(args: &CheckConfigArgs) -> Result<()> {
    let config = ConfigLoader::load(&args.config)?;

    println!("{}: OK", args.config.display());
    println!(
        "  cycle every {}s, {} worker(s), {} {} bars",
        config.engine.cycle_interval_secs,
        config.engine.workers,
        config.engine.bars,
        config.engine.timeframe
    );
    println!(
        "  portfolio: max {} trades, max {}% risk, emergency stop {}",
        config.portfolio.max_concurrent_trades,
        config.portfolio.max_risk_percent,
        if config.portfolio.emergency_stop { "ON" } else { "off" }
    );
    println!(
        "  approval: cooldown {}s, stacking {}, max {} per direction",
        config.approval.cooldown_secs,
        if config.approval.allow_stacking { "allowed" } else { "disallowed" },
        config.approval.max_per_direction
    );
    println!(
        "  strategy: SMA {}/{}, model blend {}",
        config.strategy.fast_period,
        config.strategy.slow_period,
        if config.strategy.blend.enabled { "on" } else { "off" }
    );
    for instrument in &config.instruments {
        println!(
            "  {:<8} {} risk {}% pip {}",
            instrument.symbol,
            if instrument.enabled { "enabled " } else { "disabled" },
            instrument.risk_percent,
            instrument.spec.pip_size
        );
    }
    Ok(())
}
