use crate::error::{BrokerError, ErrorKind};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker-assigned position identifier.
pub type Ticket = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Side of an order or an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for long, -1 for short. Multiply a price move by this to get profit direction.
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Buy,
    Sell,
    Hold,
}

impl SignalDirection {
    /// Order side for an actionable signal, `None` for `Hold`.
    #[must_use]
    pub const fn side(self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Buy),
            Self::Sell => Some(Side::Sell),
            Self::Hold => None,
        }
    }
}

impl From<Side> for SignalDirection {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => Self::Buy,
            Side::Sell => Self::Sell,
        }
    }
}

/// Trading decision produced by a strategy for one instrument in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub instrument: String,
    pub direction: SignalDirection,
    /// Confidence from 0.0 to 1.0
    pub confidence: f64,
    pub suggested_stop: Option<Decimal>,
    pub suggested_target: Option<Decimal>,
    /// Price the signal was computed on (last close)
    pub reference_price: Decimal,
    pub reason: String,
    pub generated_at: DateTime<Utc>,
}

impl Signal {
    /// Creates an actionable signal.
    ///
    /// # Errors
    /// Returns error if `confidence` is outside [0.0, 1.0].
    pub fn new(
        instrument: impl Into<String>,
        direction: SignalDirection,
        confidence: f64,
        reference_price: Decimal,
        reason: impl Into<String>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            anyhow::bail!("Confidence must be between 0.0 and 1.0, got {confidence}");
        }
        Ok(Self {
            instrument: instrument.into(),
            direction,
            confidence,
            suggested_stop: None,
            suggested_target: None,
            reference_price,
            reason: reason.into(),
            generated_at: Utc::now(),
        })
    }

    /// Creates a `Hold` signal; holds never reach the gate.
    #[must_use]
    pub fn hold(
        instrument: impl Into<String>,
        reference_price: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            direction: SignalDirection::Hold,
            confidence: 0.0,
            suggested_stop: None,
            suggested_target: None,
            reference_price,
            reason: reason.into(),
            generated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_stop(mut self, stop: Decimal) -> Self {
        self.suggested_stop = Some(stop);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: Decimal) -> Self {
        self.suggested_target = Some(target);
        self
    }

    #[must_use]
    pub const fn is_hold(&self) -> bool {
        matches!(self.direction, SignalDirection::Hold)
    }
}

/// Output of an ML or sentiment model for one instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub direction: SignalDirection,
    pub confidence: f64,
}

/// Market order built from an approved and sized signal. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub volume: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Option<Decimal>,
    /// Maximum accepted deviation from `reference_price`, in price units
    pub max_slippage: Decimal,
    pub reference_price: Decimal,
    pub comment: String,
}

/// Fill reported by the broker for an open or close request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerFill {
    pub ticket: Ticket,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AccountState {
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
}

/// Result of one logical broker request after retries are exhausted or it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub ticket: Option<Ticket>,
    pub filled_price: Option<Decimal>,
    pub filled_volume: Option<Decimal>,
    pub error_kind: Option<ErrorKind>,
    pub broker_error_code: Option<i32>,
    /// Broker calls made; zero when failing fast
    pub attempts: u32,
    pub message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    #[must_use]
    pub fn filled(fill: &BrokerFill, attempts: u32) -> Self {
        Self {
            success: true,
            ticket: Some(fill.ticket),
            filled_price: Some(fill.price),
            filled_volume: Some(fill.volume),
            error_kind: None,
            broker_error_code: None,
            attempts,
            message: None,
            completed_at: Utc::now(),
        }
    }

    /// Successful request that produced no fill (stop/target modification).
    #[must_use]
    pub fn acknowledged(ticket: Ticket, attempts: u32) -> Self {
        Self {
            success: true,
            ticket: Some(ticket),
            filled_price: None,
            filled_volume: None,
            error_kind: None,
            broker_error_code: None,
            attempts,
            message: None,
            completed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn broker_failure(error: &BrokerError, attempts: u32) -> Self {
        Self {
            success: false,
            ticket: None,
            filled_price: None,
            filled_volume: None,
            error_kind: Some(error.kind()),
            broker_error_code: Some(error.code()),
            attempts,
            message: Some(error.to_string()),
            completed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ticket: None,
            filled_price: None,
            filled_volume: None,
            error_kind: Some(ErrorKind::CircuitOpen),
            broker_error_code: None,
            attempts: 0,
            message: Some(message.into()),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn signal_rejects_out_of_range_confidence() {
        assert!(Signal::new("EURUSD", SignalDirection::Buy, 1.2, dec!(1.1), "x").is_err());
        assert!(Signal::new("EURUSD", SignalDirection::Buy, -0.1, dec!(1.1), "x").is_err());
        assert!(Signal::new("EURUSD", SignalDirection::Buy, 1.0, dec!(1.1), "x").is_ok());
    }

    #[test]
    fn hold_has_no_side() {
        let signal = Signal::hold("EURUSD", dec!(1.1), "flat");
        assert!(signal.is_hold());
        assert_eq!(signal.direction.side(), None);
        assert_eq!(SignalDirection::Sell.side(), Some(Side::Sell));
    }

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), Decimal::NEGATIVE_ONE);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }

    #[test]
    fn broker_failure_outcome_carries_code_and_kind() {
        let outcome = ExecutionOutcome::broker_failure(&BrokerError::MarketClosed, 1);
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind, Some(ErrorKind::PermanentBrokerError));
        assert_eq!(outcome.broker_error_code, Some(10018));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn circuit_open_outcome_makes_no_attempts() {
        let outcome = ExecutionOutcome::circuit_open("open");
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.error_kind, Some(ErrorKind::CircuitOpen));
    }
}
