use crate::circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig};
use crate::retry::RetryPolicy;
use fx_engine_core::config::ExecutionConfig;
use fx_engine_core::error::BrokerError;
use fx_engine_core::events::{AccountState, BrokerFill, ExecutionOutcome, OrderRequest, Ticket};
use fx_engine_core::traits::BrokerConnector;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A broker call that changes broker-side state.
#[derive(Debug, Clone, Copy)]
enum Mutation<'a> {
    Submit(&'a OrderRequest),
    Close {
        ticket: Ticket,
        volume: Option<Decimal>,
    },
    Modify {
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    },
}

impl Mutation<'_> {
    const fn label(&self) -> &'static str {
        match self {
            Self::Submit(_) => "submit_order",
            Self::Close { .. } => "close_position",
            Self::Modify { .. } => "modify_position",
        }
    }

    const fn ticket(&self) -> Option<Ticket> {
        match self {
            Self::Submit(_) => None,
            Self::Close { ticket, .. } | Self::Modify { ticket, .. } => Some(*ticket),
        }
    }

    async fn send(
        self,
        connector: &mut dyn BrokerConnector,
    ) -> Result<Option<BrokerFill>, BrokerError> {
        match self {
            Self::Submit(order) => connector.submit_order(order).await.map(Some),
            Self::Close { ticket, volume } => connector.close_position(ticket, volume).await.map(Some),
            Self::Modify {
                ticket,
                stop,
                target,
            } => connector
                .modify_position(ticket, stop, target)
                .await
                .map(|()| None),
        }
    }
}

/// Owns the broker connection and the only code path that mutates broker state.
///
/// Every call is serialized through one async mutex. Mutating calls are
/// retried on transient errors and then reported to the circuit breaker once
/// per call. The lock is released while backing off so sibling traders are
/// not blocked.
pub struct ExecutionManager {
    connector: Mutex<Box<dyn BrokerConnector>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ExecutionManager {
    #[must_use]
    pub fn new(connector: Box<dyn BrokerConnector>, config: &ExecutionConfig) -> Self {
        Self::with_policies(
            connector,
            RetryPolicy::from_execution(config),
            CircuitBreakerConfig::from_execution(config),
        )
    }

    #[must_use]
    pub fn with_policies(
        connector: Box<dyn BrokerConnector>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            connector: Mutex::new(connector),
            breaker: CircuitBreaker::new(breaker),
            retry,
        }
    }

    /// Submits a market order.
    pub async fn execute(&self, order: &OrderRequest) -> ExecutionOutcome {
        self.mutate(Mutation::Submit(order)).await
    }

    /// Closes `volume` lots of `ticket`, or the whole position when `None`.
    pub async fn close_position(&self, ticket: Ticket, volume: Option<Decimal>) -> ExecutionOutcome {
        self.mutate(Mutation::Close { ticket, volume }).await
    }

    pub async fn modify_position(
        &self,
        ticket: Ticket,
        stop: Option<Decimal>,
        target: Option<Decimal>,
    ) -> ExecutionOutcome {
        self.mutate(Mutation::Modify {
            ticket,
            stop,
            target,
        })
        .await
    }

    /// Reads the account; serialized with every other call but neither
    /// retried nor counted by the breaker.
    ///
    /// # Errors
    /// Returns the broker error unchanged.
    pub async fn account_state(&self) -> Result<AccountState, BrokerError> {
        self.connector.lock().await.account_state().await
    }

    /// # Errors
    /// Returns the broker error unchanged.
    pub async fn open_tickets(&self) -> Result<Vec<Ticket>, BrokerError> {
        self.connector.lock().await.open_tickets().await
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    #[must_use]
    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs one logical call: retries transient errors, then reports the call
    /// to the breaker once. A half-open trial gets a single attempt.
    async fn mutate(&self, call: Mutation<'_>) -> ExecutionOutcome {
        let op = call.label();
        if let Err(e) = self.breaker.try_acquire() {
            warn!(op, ticket = ?call.ticket(), error = %e, "Broker call refused, circuit not closed");
            return ExecutionOutcome::circuit_open(e.to_string());
        }

        let max_attempts = if self.breaker.state() == BreakerState::HalfOpen {
            1
        } else {
            self.retry.max_attempts()
        };
        let mut delay = self.retry.base_delay.min(self.retry.max_delay);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = {
                let mut connector = self.connector.lock().await;
                call.send(connector.as_mut()).await
            };

            match result {
                Ok(fill) => {
                    self.breaker.record_success();
                    debug!(op, attempts, "Broker call succeeded");
                    return match (fill, call.ticket()) {
                        (Some(fill), _) => ExecutionOutcome::filled(&fill, attempts),
                        (None, Some(ticket)) => ExecutionOutcome::acknowledged(ticket, attempts),
                        (None, None) => ExecutionOutcome::acknowledged(0, attempts),
                    };
                }
                Err(e) if e.is_transient() => {
                    if attempts >= max_attempts {
                        self.breaker.record_failure();
                        if self.breaker.state() == BreakerState::Open {
                            error!(op, attempts, error = %e, "Broker call failed, circuit breaker open");
                        } else {
                            warn!(op, attempts, error = %e, "Broker call failed, retries exhausted");
                        }
                        return ExecutionOutcome::broker_failure(&e, attempts);
                    }
                    warn!(
                        op,
                        attempt = attempts,
                        max_retries = self.retry.max_retries,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Broker call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.retry.next_delay(delay);
                }
                Err(e) => {
                    // The broker answered, so the link is healthy
                    self.breaker.record_success();
                    warn!(op, code = e.code(), error = %e, "Broker rejected call");
                    return ExecutionOutcome::broker_failure(&e, attempts);
                }
            }
        }
    }
}
