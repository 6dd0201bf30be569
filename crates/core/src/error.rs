//! Error taxonomy shared by every engine component.
//!
//! Failures are classified into a small set of [`ErrorKind`]s so that each
//! component can decide how far a failure propagates: a transient broker
//! error is retried, a permanent one is surfaced on the affected instrument
//! only, and an open circuit skips execution for the whole broker session.

use crate::events::Ticket;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failure, recorded on outcomes and cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Broker failure that may succeed if retried (timeout, requote, busy server).
    TransientBrokerError,
    /// Broker rejection that will not succeed on retry (invalid volume, market closed).
    PermanentBrokerError,
    /// Sizing inputs are missing or degenerate; no trade is placed.
    InvalidRiskInput,
    /// Circuit breaker is open; the broker was not contacted.
    CircuitOpen,
    /// Market data or signal could not be obtained for the instrument.
    DataUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientBrokerError => "transient_broker_error",
            Self::PermanentBrokerError => "permanent_broker_error",
            Self::InvalidRiskInput => "invalid_risk_input",
            Self::CircuitOpen => "circuit_open",
            Self::DataUnavailable => "data_unavailable",
        };
        f.write_str(name)
    }
}

/// Errors reported by a broker connector.
///
/// Codes follow the numeric return codes of MetaTrader-style trade servers so
/// they can be surfaced unchanged to operators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// Request timed out before the server answered.
    #[error("request timed out")]
    Timeout,

    /// Price moved; the server offered a new quote.
    #[error("requote at {price}")]
    Requote {
        /// Price offered by the server.
        price: Decimal,
    },

    /// No quotes available to process the request.
    #[error("no prices available")]
    PriceOff,

    /// Server is busy or rate limiting requests.
    #[error("trade server busy")]
    ServerBusy,

    /// Connection to the trade server was lost.
    #[error("no connection to trade server")]
    ConnectionLost,

    /// Requested volume is not tradable.
    #[error("invalid volume {volume}")]
    InvalidVolume {
        /// Volume that was rejected.
        volume: Decimal,
    },

    /// Stop loss or take profit rejected.
    #[error("invalid stops")]
    InvalidStops,

    /// Market is closed for the instrument.
    #[error("market closed")]
    MarketClosed,

    /// Not enough free margin for the order.
    #[error("insufficient margin")]
    InsufficientMargin,

    /// Ticket is not an open position on the broker.
    #[error("position {ticket} not found")]
    PositionNotFound {
        /// Ticket that was not found.
        ticket: Ticket,
    },

    /// Any other rejection with its raw return code.
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// Raw broker return code.
        code: i32,
        /// Broker message.
        message: String,
    },
}

impl BrokerError {
    /// Creates a generic rejection.
    pub fn rejected(code: i32, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Returns the broker return code for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Requote { .. } => 10004,
            Self::Timeout => 10012,
            Self::InvalidVolume { .. } => 10014,
            Self::InvalidStops => 10016,
            Self::MarketClosed => 10018,
            Self::InsufficientMargin => 10019,
            Self::PriceOff => 10021,
            Self::ServerBusy => 10024,
            Self::ConnectionLost => 10031,
            Self::PositionNotFound { .. } => 10036,
            Self::Rejected { code, .. } => *code,
        }
    }

    /// Returns true if the request may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Requote { .. }
                | Self::PriceOff
                | Self::ServerBusy
                | Self::ConnectionLost
        )
    }

    /// Returns the engine-level classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientBrokerError
        } else {
            ErrorKind::PermanentBrokerError
        }
    }
}

/// Reasons a volume cannot be computed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizingError {
    /// Signal carried no stop price.
    #[error("stop price missing")]
    MissingStop,

    /// Entry and stop are equal.
    #[error("stop distance is zero")]
    ZeroStopDistance,

    /// A numeric input that must be positive was not.
    #[error("{field} must be positive, got {value}")]
    NonPositive {
        /// Name of the offending input.
        field: &'static str,
        /// Value received.
        value: Decimal,
    },
}

impl SizingError {
    /// Every sizing failure is an invalid risk input.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRiskInput
    }
}

/// Market data could not be obtained for an instrument this cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
    /// Provider did not answer within the configured timeout.
    #[error("market data request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Provider answered with no bars.
    #[error("no bars returned")]
    Empty,

    /// Provider failed.
    #[error("market data provider failed: {0}")]
    Provider(String),
}

impl DataError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::DataUnavailable
    }
}

/// Configuration validation failure listing every problem found.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    /// Human readable problems, one per invalid field.
    pub problems: Vec<String>,
}
