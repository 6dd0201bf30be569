use crate::ledger::{LedgerTotals, Reservation, RiskLedger};
use chrono::{DateTime, Utc};
use fx_engine_core::config::{ApprovalConfig, EngineConfig, PortfolioLimits};
use fx_engine_core::events::Side;
use fx_engine_core::portfolio::PortfolioState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    EmergencyStop,
    LowConfidence,
    Cooldown,
    StackingDisallowed,
    MaxPerDirection,
    MaxConcurrentTrades,
    PortfolioRiskCap,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EmergencyStop => "emergency_stop",
            Self::LowConfidence => "low_confidence",
            Self::Cooldown => "cooldown",
            Self::StackingDisallowed => "stacking_disallowed",
            Self::MaxPerDirection => "max_per_direction",
            Self::MaxConcurrentTrades => "max_concurrent_trades",
            Self::PortfolioRiskCap => "portfolio_risk_cap",
        };
        f.write_str(s)
    }
}

/// A signal asking to open exposure.
#[derive(Debug, Clone)]
pub struct ApprovalRequest<'a> {
    pub instrument: &'a str,
    pub side: Side,
    /// Risk the trade may add, in percent of equity
    pub risk_percent: Decimal,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Policy checks between a signal and an order.
///
/// Checks run in a fixed order and stop at the first failure. Every check
/// reads the frozen cycle snapshot; the portfolio caps also count
/// reservations already granted this cycle.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    limits: PortfolioLimits,
    approval: ApprovalConfig,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            limits: config.portfolio.clone(),
            approval: config.approval.clone(),
        }
    }

    #[must_use]
    pub const fn min_confidence(&self) -> f64 {
        self.approval.min_confidence
    }

    /// Approves the request and reserves its exposure, or names the first failed check.
    ///
    /// # Errors
    /// Returns the `RejectionReason` of the first check that fails.
    pub fn evaluate<'l>(
        &self,
        snapshot: &PortfolioState,
        ledger: &'l RiskLedger,
        request: &ApprovalRequest<'_>,
    ) -> Result<Reservation<'l>, RejectionReason> {
        if snapshot.emergency_stop {
            return Err(RejectionReason::EmergencyStop);
        }

        if let Some(last) = request.last_trade_at {
            let elapsed = (request.now - last).to_std().unwrap_or_default();
            if elapsed < self.approval.cooldown() {
                return Err(RejectionReason::Cooldown);
            }
        }

        let same_direction = snapshot.same_direction_count(request.instrument, request.side);
        if same_direction > 0 && !self.approval.allow_stacking {
            return Err(RejectionReason::StackingDisallowed);
        }
        if same_direction >= self.approval.max_per_direction {
            return Err(RejectionReason::MaxPerDirection);
        }

        ledger.try_reserve(request.risk_percent, |reserved: LedgerTotals| {
            if snapshot.open_position_count + reserved.count + 1 > self.limits.max_concurrent_trades {
                return Err(RejectionReason::MaxConcurrentTrades);
            }
            let projected = snapshot.aggregate_risk_percent + reserved.risk_percent + request.risk_percent;
            if projected > self.limits.max_risk_percent {
                return Err(RejectionReason::PortfolioRiskCap);
            }
            Ok(())
        })
    }
}
