use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Immutable configuration snapshot shared by reference.
///
/// Each cycle clones the `Arc` once at start; a reload replaces the `Arc`,
/// never fields inside it.
pub type SharedConfig = Arc<ConfigSnapshot>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Incremented on every accepted reload
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub config: EngineConfig,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn new(version: u64, config: EngineConfig) -> Self {
        Self {
            version,
            loaded_at: Utc::now(),
            config,
        }
    }

    #[must_use]
    pub fn shared(version: u64, config: EngineConfig) -> SharedConfig {
        Arc::new(Self::new(version, config))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub portfolio: PortfolioLimits,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub cycle_interval_secs: u64,
    /// Traders evaluated concurrently; 1 runs them serially
    pub workers: usize,
    pub timeframe: String,
    pub bars: usize,
    pub data_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            workers: 1,
            timeframe: "M15".to_string(),
            bars: 100,
            data_timeout_ms: 5_000,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    #[must_use]
    pub const fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }
}

/// Portfolio-wide caps and the emergency stop switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioLimits {
    pub max_concurrent_trades: u32,
    /// Cap on summed open risk, in percent of equity
    pub max_risk_percent: Decimal,
    /// Trips the emergency stop when equity falls this far below the session peak
    pub max_drawdown_percent: Option<Decimal>,
    pub emergency_stop: bool,
    /// Close every open position while the emergency stop is active
    pub liquidate_on_emergency: bool,
}

impl Default for PortfolioLimits {
    fn default() -> Self {
        Self {
            max_concurrent_trades: 5,
            max_risk_percent: Decimal::from(5),
            max_drawdown_percent: None,
            emergency_stop: false,
            liquidate_on_emergency: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub cooldown_secs: u64,
    pub allow_stacking: bool,
    pub max_per_direction: u32,
    /// Signals below this confidence are rejected before the gate
    pub min_confidence: f64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            allow_stacking: false,
            max_per_direction: 1,
            min_confidence: 0.0,
        }
    }
}

impl ApprovalConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed calls that open the circuit
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub max_slippage_pips: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 4_000,
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            max_slippage_pips: Decimal::from(3),
        }
    }
}

impl ExecutionConfig {
    #[must_use]
    pub const fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub breakeven: BreakevenConfig,
    pub trailing: TrailingConfig,
    pub partial_close: PartialCloseConfig,
    pub ai_close: AiCloseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakevenConfig {
    pub enabled: bool,
    pub trigger_pips: Decimal,
    /// Pips beyond entry the stop is placed at, in the profit direction
    pub offset_pips: Decimal,
}

impl Default for BreakevenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_pips: Decimal::from(20),
            offset_pips: Decimal::from(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub enabled: bool,
    pub distance_pips: Decimal,
    pub step_pips: Decimal,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_pips: Decimal::from(25),
            step_pips: Decimal::from(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialCloseConfig {
    pub enabled: bool,
    pub trigger_pips: Decimal,
    /// Fraction of the open volume to close, in (0, 1)
    pub fraction: Decimal,
}

impl Default for PartialCloseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_pips: Decimal::from(40),
            fraction: Decimal::new(5, 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiCloseConfig {
    pub enabled: bool,
    /// Losing positions whose predicted chance of ending profitable is below this are closed
    pub min_profit_probability: f64,
}

impl Default for AiCloseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_profit_probability: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub atr_period: usize,
    pub stop_atr_multiple: Decimal,
    pub reward_risk: Decimal,
    pub blend: BlendConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 30,
            atr_period: 14,
            stop_atr_multiple: Decimal::new(15, 1),
            reward_risk: Decimal::from(2),
            blend: BlendConfig::default(),
        }
    }
}

/// How a model prediction adjusts a technical signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// Consult the model before trading a technical signal
    pub enabled: bool,
    pub technical_weight: f64,
    pub model_weight: f64,
    /// A disagreeing prediction at or above this confidence turns the signal into a hold
    pub veto_confidence: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            technical_weight: 0.6,
            model_weight: 0.4,
            veto_confidence: 0.7,
        }
    }
}

/// Contract parameters needed to convert price distances into money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Price increment of one pip (0.0001 for EURUSD)
    pub pip_size: Decimal,
    /// Account-currency value of one pip for one lot
    pub pip_value_per_lot: Decimal,
    #[serde(default = "default_volume_step")]
    pub volume_step: Decimal,
    #[serde(default = "default_volume_min")]
    pub volume_min: Decimal,
    #[serde(default = "default_volume_max")]
    pub volume_max: Decimal,
}

fn default_volume_step() -> Decimal {
    Decimal::new(1, 2)
}

fn default_volume_min() -> Decimal {
    Decimal::new(1, 2)
}

fn default_volume_max() -> Decimal {
    Decimal::from(100)
}

impl InstrumentSpec {
    /// Rounds `volume` down to a multiple of the volume step.
    #[must_use]
    pub fn round_down(&self, volume: Decimal) -> Decimal {
        if self.volume_step <= Decimal::ZERO {
            return volume;
        }
        (volume / self.volume_step).floor() * self.volume_step
    }

    #[must_use]
    pub fn pips_to_price(&self, pips: Decimal) -> Decimal {
        pips * self.pip_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Equity risked per trade, in percent
    pub risk_percent: Decimal,
    #[serde(flatten)]
    pub spec: InstrumentSpec,
}

const fn default_enabled() -> bool {
    true
}

impl EngineConfig {
    #[must_use]
    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }

    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentConfig> {
        self.instruments.iter().filter(|i| i.enabled)
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    /// Returns a `ConfigError` listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.engine.cycle_interval_secs == 0 {
            problems.push("engine.cycle_interval_secs must be at least 1".to_string());
        }
        if self.engine.workers == 0 {
            problems.push("engine.workers must be at least 1".to_string());
        }
        if self.engine.bars == 0 {
            problems.push("engine.bars must be at least 1".to_string());
        }
        if self.portfolio.max_concurrent_trades == 0 {
            problems.push("portfolio.max_concurrent_trades must be at least 1".to_string());
        }
        if self.portfolio.max_risk_percent <= Decimal::ZERO {
            problems.push("portfolio.max_risk_percent must be positive".to_string());
        }
        if let Some(dd) = self.portfolio.max_drawdown_percent {
            if dd <= Decimal::ZERO || dd >= Decimal::ONE_HUNDRED {
                problems.push("portfolio.max_drawdown_percent must be in (0, 100)".to_string());
            }
        }
        if self.approval.max_per_direction == 0 {
            problems.push("approval.max_per_direction must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.approval.min_confidence) {
            problems.push("approval.min_confidence must be in [0, 1]".to_string());
        }
        if self.execution.failure_threshold == 0 {
            problems.push("execution.failure_threshold must be at least 1".to_string());
        }
        if self.execution.max_backoff_ms < self.execution.base_backoff_ms {
            problems.push("execution.max_backoff_ms must be >= base_backoff_ms".to_string());
        }
        if self.execution.max_slippage_pips < Decimal::ZERO {
            problems.push("execution.max_slippage_pips must not be negative".to_string());
        }

        let lc = &self.lifecycle;
        if lc.breakeven.enabled && lc.breakeven.trigger_pips <= lc.breakeven.offset_pips {
            problems.push("lifecycle.breakeven.trigger_pips must exceed offset_pips".to_string());
        }
        if lc.trailing.enabled
            && (lc.trailing.distance_pips <= Decimal::ZERO || lc.trailing.step_pips <= Decimal::ZERO)
        {
            problems.push("lifecycle.trailing distance and step must be positive".to_string());
        }
        if lc.partial_close.enabled
            && (lc.partial_close.fraction <= Decimal::ZERO
                || lc.partial_close.fraction >= Decimal::ONE)
        {
            problems.push("lifecycle.partial_close.fraction must be in (0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&lc.ai_close.min_profit_probability) {
            problems.push("lifecycle.ai_close.min_profit_probability must be in [0, 1]".to_string());
        }

        let st = &self.strategy;
        if st.fast_period == 0 || st.fast_period >= st.slow_period {
            problems.push("strategy.fast_period must be positive and below slow_period".to_string());
        }
        if st.slow_period > self.engine.bars {
            problems.push("strategy.slow_period must not exceed engine.bars".to_string());
        }
        if st.atr_period == 0 || st.atr_period >= self.engine.bars {
            problems.push("strategy.atr_period must be positive and below engine.bars".to_string());
        }
        if st.stop_atr_multiple <= Decimal::ZERO {
            problems.push("strategy.stop_atr_multiple must be positive".to_string());
        }
        let blend = &st.blend;
        if blend.technical_weight < 0.0
            || blend.model_weight < 0.0
            || blend.technical_weight + blend.model_weight <= 0.0
        {
            problems.push("strategy.blend weights must be non-negative with a positive sum".to_string());
        }

        if self.enabled_instruments().next().is_none() {
            problems.push("at least one enabled instrument is required".to_string());
        }
        let mut seen = HashSet::new();
        for inst in &self.instruments {
            if !seen.insert(inst.symbol.as_str()) {
                problems.push(format!("instrument {} is listed twice", inst.symbol));
            }
            if inst.risk_percent <= Decimal::ZERO {
                problems.push(format!("{}: risk_percent must be positive", inst.symbol));
            }
            if inst.risk_percent > self.portfolio.max_risk_percent {
                problems.push(format!(
                    "{}: risk_percent exceeds portfolio.max_risk_percent",
                    inst.symbol
                ));
            }
            let spec = &inst.spec;
            if spec.pip_size <= Decimal::ZERO || spec.pip_value_per_lot <= Decimal::ZERO {
                problems.push(format!("{}: pip_size and pip_value_per_lot must be positive", inst.symbol));
            }
            if spec.volume_step <= Decimal::ZERO
                || spec.volume_min <= Decimal::ZERO
                || spec.volume_max < spec.volume_min
            {
                problems.push(format!("{}: invalid volume limits", inst.symbol));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }
}
