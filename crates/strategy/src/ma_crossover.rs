use crate::indicators::{atr, sma};
use anyhow::Result;
use async_trait::async_trait;
use fx_engine_core::config::StrategyConfig;
use fx_engine_core::events::{Bar, Signal, SignalDirection};
use fx_engine_core::traits::Strategy;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Moving-average crossover with ATR-based stop and target.
///
/// Emits `Buy` on the bar where the fast SMA crosses above the slow SMA and
/// `Sell` on the bar where it crosses below; every other bar is a `Hold`.
/// Confidence grows with the gap between the averages measured in ATRs.
pub struct MaCrossoverStrategy {
    fast_period: usize,
    slow_period: usize,
    atr_period: usize,
    stop_atr_multiple: Decimal,
    reward_risk: Decimal,
}

impl MaCrossoverStrategy {
    #[must_use]
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            fast_period: config.fast_period,
            slow_period: config.slow_period,
            atr_period: config.atr_period,
            stop_atr_multiple: config.stop_atr_multiple,
            reward_risk: config.reward_risk,
        }
    }

    /// Bars needed before a crossover can be detected.
    #[must_use]
    pub fn warmup(&self) -> usize {
        (self.slow_period + 1).max(self.atr_period + 1)
    }
}

#[async_trait]
impl Strategy for MaCrossoverStrategy {
    async fn analyze(&self, instrument: &str, bars: &[Bar]) -> Result<Signal> {
        let Some(last) = bars.last() else {
            anyhow::bail!("no bars for {instrument}");
        };
        let price = last.close;
        let n = bars.len();

        if n < self.warmup() {
            return Ok(Signal::hold(instrument, price, format!("warming up ({n}/{})", self.warmup())));
        }

        let averages = (
            sma(bars, n - 1, self.fast_period),
            sma(bars, n - 1, self.slow_period),
            sma(bars, n, self.fast_period),
            sma(bars, n, self.slow_period),
            atr(bars, self.atr_period),
        );
        let (Some(prev_fast), Some(prev_slow), Some(fast), Some(slow), Some(atr)) = averages else {
            return Ok(Signal::hold(instrument, price, "insufficient history"));
        };
        if atr.is_zero() {
            return Ok(Signal::hold(instrument, price, "flat market"));
        }

        let direction = match (prev_fast.cmp(&prev_slow), fast.cmp(&slow)) {
            (Ordering::Less | Ordering::Equal, Ordering::Greater) => SignalDirection::Buy,
            (Ordering::Greater | Ordering::Equal, Ordering::Less) => SignalDirection::Sell,
            _ => return Ok(Signal::hold(instrument, price, "no crossover")),
        };

        let separation = ((fast - slow).abs() / atr).to_f64().unwrap_or(0.0);
        let confidence = 0.5 + 0.5 * separation.min(1.0);

        let stop_distance = atr * self.stop_atr_multiple;
        let (stop, target) = match direction {
            SignalDirection::Buy => (price - stop_distance, price + stop_distance * self.reward_risk),
            _ => (price + stop_distance, price - stop_distance * self.reward_risk),
        };

        let signal = Signal::new(
            instrument,
            direction,
            confidence,
            price,
            format!("SMA{} crossed SMA{} ({fast:.5} vs {slow:.5})", self.fast_period, self.slow_period),
        )?
        .with_stop(stop);

        Ok(if self.reward_risk > Decimal::ZERO {
            signal.with_target(target)
        } else {
            signal
        })
    }

    fn name(&self) -> &'static str {
        "MA Crossover"
    }
}
