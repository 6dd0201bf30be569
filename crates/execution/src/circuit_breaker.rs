//! Circuit breaker guarding the shared broker connection.
//!
//! The breaker is `Closed` while the broker answers. After `failure_threshold`
//! consecutive transient failures it opens and every mutating call fails fast
//! without touching the broker. Once `recovery_timeout` has elapsed exactly one
//! trial call is admitted (`HalfOpen`): success closes the breaker, failure
//! re-opens it with a fresh timeout.
//!
//! # Example
//!
//! ```
//! use fx_engine_execution::circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(2));
//! assert!(breaker.try_acquire().is_ok());
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.state(), BreakerState::Open);
//! assert!(breaker.try_acquire().is_err());
//! ```

use chrono::{DateTime, Utc};
use fx_engine_core::config::ExecutionConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    /// Default: 3
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call is allowed.
    /// Default: 60 seconds
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn from_execution(config: &ExecutionConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
        }
    }

    /// Builder method to set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, failures: u32) -> Self {
        self.failure_threshold = failures.max(1);
        self
    }

    /// Builder method to set the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of the breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    /// Set while the single half-open trial call is outstanding
    trial_in_flight: bool,
}

impl Inner {
    const fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Recovery timeout not yet elapsed.
    #[error("circuit open, {remaining_ms}ms until a trial call is allowed")]
    Open {
        /// Milliseconds until the breaker admits a trial.
        remaining_ms: u64,
    },

    /// The single half-open trial is already outstanding.
    #[error("circuit half-open, trial call in progress")]
    TrialInProgress,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Thread-safe breaker using `parking_lot::RwLock`; every transition happens
/// under one write lock.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks permission for one broker call.
    ///
    /// Moves `Open` to `HalfOpen` once the recovery timeout has elapsed and
    /// grants the caller the single trial.
    ///
    /// # Errors
    ///
    /// - `CircuitBreakerError::Open` - recovery timeout not elapsed
    /// - `CircuitBreakerError::TrialInProgress` - another caller holds the trial
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitBreakerError::TrialInProgress)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!("Circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    let remaining = self.config.recovery_timeout - elapsed;
                    Err(CircuitBreakerError::Open {
                        remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        }
    }

    /// Records a call the broker answered; resets the failure count and closes the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        if inner.state != BreakerState::Closed {
            tracing::info!(previous = %inner.state, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Records a failed call.
    ///
    /// Opens the circuit when the threshold is reached, or immediately when
    /// the failed call was the half-open trial.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Utc::now());

        let trip = inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold;
        if trip && inner.state != BreakerState::Open {
            tracing::error!(
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                "Circuit breaker opened"
            );
        }
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.trial_in_flight = false;
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.read().failure_count
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Returns to `Closed` with a zero failure count.
    pub fn reset(&self) {
        *self.inner.write() = Inner::new();
    }
}
