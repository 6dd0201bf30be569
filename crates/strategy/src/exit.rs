use anyhow::Result;
use async_trait::async_trait;
use fx_engine_core::position::Position;
use fx_engine_core::traits::ExitAdvisor;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Exit model that rates a losing position by how much of its stop distance
/// the market has already consumed.
///
/// A position at entry scores 0.5 and the score falls linearly to 0 at the
/// stop. Positions without a stop, or with the stop at or past entry, get no
/// opinion.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopDistanceAdvisor;

#[async_trait]
impl ExitAdvisor for StopDistanceAdvisor {
    async fn profit_probability(&self, position: &Position, price: Decimal) -> Result<Option<f64>> {
        let Some(stop) = position.current_stop else {
            return Ok(None);
        };
        let risk_pips = position.profit_pips(stop).abs();
        if position.profit_pips(stop) >= Decimal::ZERO || risk_pips.is_zero() {
            return Ok(None);
        }

        let loss_pips = (-position.profit_pips(price)).max(Decimal::ZERO);
        let consumed = (loss_pips / risk_pips).min(Decimal::ONE);
        let probability = (Decimal::ONE - consumed) / Decimal::TWO;
        Ok(probability.to_f64())
    }
}
