//! Cycle-local record of exposure approved but not yet visible in the snapshot.
//!
//! Traders running in parallel share one frozen `PortfolioState`. Each
//! approval reserves a slot and its risk here so that concurrent approvals
//! cannot jointly exceed the portfolio caps. The snapshot itself is never
//! mutated.

use parking_lot::Mutex;
use rust_decimal::Decimal;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerTotals {
    /// Open and committed-this-cycle slots reserved on top of the snapshot
    pub count: u32,
    pub risk_percent: Decimal,
}

#[derive(Debug, Default)]
pub struct RiskLedger {
    totals: Mutex<LedgerTotals>,
}

impl RiskLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically checks `admit` against the current totals and reserves one
    /// slot with `risk_percent` if it passes.
    ///
    /// # Errors
    /// Returns whatever `admit` rejects with; nothing is reserved in that case.
    pub fn try_reserve<E>(
        &self,
        risk_percent: Decimal,
        admit: impl FnOnce(LedgerTotals) -> Result<(), E>,
    ) -> Result<Reservation<'_>, E> {
        let mut totals = self.totals.lock();
        admit(*totals)?;
        totals.count += 1;
        totals.risk_percent += risk_percent;
        Ok(Reservation {
            ledger: self,
            risk_percent,
            committed: false,
        })
    }

    #[must_use]
    pub fn totals(&self) -> LedgerTotals {
        *self.totals.lock()
    }

    fn release(&self, risk_percent: Decimal) {
        let mut totals = self.totals.lock();
        totals.count = totals.count.saturating_sub(1);
        totals.risk_percent -= risk_percent;
    }

    fn adjust(&self, delta: Decimal) {
        self.totals.lock().risk_percent += delta;
    }
}

/// Approved exposure held until the order executes.
///
/// Dropping an uncommitted reservation returns its slot and risk.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct Reservation<'a> {
    ledger: &'a RiskLedger,
    risk_percent: Decimal,
    committed: bool,
}

impl Reservation<'_> {
    #[must_use]
    pub const fn risk_percent(&self) -> Decimal {
        self.risk_percent
    }

    /// Replaces the reserved risk with the risk actually sized; never grows it.
    pub fn settle(&mut self, risk_percent: Decimal) {
        if risk_percent < self.risk_percent {
            self.ledger.adjust(risk_percent - self.risk_percent);
            self.risk_percent = risk_percent;
        }
    }

    /// Keeps the reservation for the rest of the cycle.
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Keeps the reservation at the risk realised by the fill, which may be
    /// above the sized risk by the accepted slippage.
    pub fn commit_filled(mut self, risk_percent: Decimal) {
        self.ledger.adjust(risk_percent - self.risk_percent);
        self.risk_percent = risk_percent;
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.release(self.risk_percent);
        }
    }
}
