use anyhow::Result;
use async_trait::async_trait;
use fx_engine_core::events::{Bar, Prediction, SignalDirection};
use fx_engine_core::traits::Predictor;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Rate-of-change predictor standing in for an external model.
///
/// Direction follows the sign of the change over `lookback` bars; confidence
/// is the move measured against `full_scale`, capped at 1.
pub struct MomentumPredictor {
    lookback: usize,
    full_scale: Decimal,
}

impl MomentumPredictor {
    #[must_use]
    pub const fn new(lookback: usize, full_scale: Decimal) -> Self {
        Self {
            lookback,
            full_scale,
        }
    }
}

#[async_trait]
impl Predictor for MomentumPredictor {
    async fn predict(&self, instrument: &str, bars: &[Bar]) -> Result<Prediction> {
        if self.lookback == 0 || bars.len() <= self.lookback {
            anyhow::bail!("{instrument}: need more than {} bars, got {}", self.lookback, bars.len());
        }
        let last = bars[bars.len() - 1].close;
        let base = bars[bars.len() - 1 - self.lookback].close;
        let change = last - base;

        let direction = match change.cmp(&Decimal::ZERO) {
            std::cmp::Ordering::Greater => SignalDirection::Buy,
            std::cmp::Ordering::Less => SignalDirection::Sell,
            std::cmp::Ordering::Equal => SignalDirection::Hold,
        };
        let confidence = if self.full_scale > Decimal::ZERO {
            (change.abs() / self.full_scale).to_f64().unwrap_or(0.0).min(1.0)
        } else {
            0.0
        };

        Ok(Prediction {
            direction,
            confidence,
        })
    }
}
