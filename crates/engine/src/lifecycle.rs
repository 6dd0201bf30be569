//! Post-entry management of open positions.
//!
//! Once per cycle every tracked position goes through, in order: breakeven,
//! trailing stop, partial close and model-driven early close. Stops only ever
//! move in the position's favour. While the emergency stop is active the
//! stop-moving rules are suppressed and only closes are sent; with
//! `liquidate_on_emergency` every position is closed in full.

use crate::events::{LifecycleAction, LifecycleActionKind};
use fx_engine_core::config::LifecycleConfig;
use fx_engine_core::events::{ExecutionOutcome, Ticket};
use fx_engine_core::position::Position;
use fx_engine_core::traits::ExitAdvisor;
use fx_engine_execution::ExecutionManager;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs for one sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext<'a> {
    pub config: &'a LifecycleConfig,
    pub emergency_stop: bool,
    pub liquidate_on_emergency: bool,
    /// Latest price per instrument; positions without one are left untouched
    pub prices: &'a HashMap<String, Decimal>,
}

enum Step {
    Continue,
    Closed,
}

/// Sole owner of open positions once they are filled.
#[derive(Default)]
pub struct PositionLifecycleManager {
    positions: BTreeMap<Ticket, Position>,
    advisor: Option<Arc<dyn ExitAdvisor>>,
}

impl std::fmt::Debug for PositionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLifecycleManager")
            .field("positions", &self.positions.len())
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

impl PositionLifecycleManager {
    #[must_use]
    pub fn new(advisor: Option<Arc<dyn ExitAdvisor>>) -> Self {
        Self {
            positions: BTreeMap::new(),
            advisor,
        }
    }

    pub fn track(&mut self, position: Position) {
        debug!(ticket = position.ticket, instrument = %position.instrument, "Tracking position");
        self.positions.insert(position.ticket, position);
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    #[must_use]
    pub fn position(&self, ticket: Ticket) -> Option<&Position> {
        self.positions.get(&ticket)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Runs every rule over every open position.
    pub async fn sweep(
        &mut self,
        ctx: SweepContext<'_>,
        execution: &ExecutionManager,
    ) -> Vec<LifecycleAction> {
        let mut actions = self.reconcile(execution).await;

        let tickets: Vec<Ticket> = self.positions.keys().copied().collect();
        for ticket in tickets {
            let Some(mut position) = self.positions.remove(&ticket) else {
                continue;
            };
            let Some(&price) = ctx.prices.get(&position.instrument) else {
                debug!(ticket, instrument = %position.instrument, "No price this cycle, skipping position");
                self.positions.insert(ticket, position);
                continue;
            };

            let step = self
                .manage(&mut position, price, ctx, execution, &mut actions)
                .await;
            if matches!(step, Step::Continue) {
                self.positions.insert(ticket, position);
            }
        }
        actions
    }

    /// Drops positions the broker no longer reports.
    async fn reconcile(&mut self, execution: &ExecutionManager) -> Vec<LifecycleAction> {
        if self.positions.is_empty() {
            return Vec::new();
        }
        let open: HashSet<Ticket> = match execution.open_tickets().await {
            Ok(tickets) => tickets.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Could not read open tickets, skipping reconciliation");
                return Vec::new();
            }
        };

        let gone: Vec<Ticket> = self
            .positions
            .keys()
            .filter(|t| !open.contains(t))
            .copied()
            .collect();
        gone.into_iter()
            .filter_map(|ticket| self.positions.remove(&ticket))
            .map(|position| {
                info!(ticket = position.ticket, instrument = %position.instrument, "Position closed broker-side");
                LifecycleAction {
                    ticket: position.ticket,
                    instrument: position.instrument,
                    action: LifecycleActionKind::ClosedByBroker,
                    outcome: None,
                }
            })
            .collect()
    }

    async fn manage(
        &self,
        position: &mut Position,
        price: Decimal,
        ctx: SweepContext<'_>,
        execution: &ExecutionManager,
        actions: &mut Vec<LifecycleAction>,
    ) -> Step {
        if ctx.emergency_stop && ctx.liquidate_on_emergency {
            let outcome = execution.close_position(position.ticket, None).await;
            return record_close(position, LifecycleActionKind::EmergencyClose, outcome, actions);
        }

        if !ctx.emergency_stop {
            apply_breakeven(position, price, ctx.config, execution, actions).await;
            apply_trailing(position, price, ctx.config, execution, actions).await;
        }

        apply_partial_close(position, price, ctx.config, execution, actions).await;

        self.apply_early_close(position, price, ctx.config, execution, actions)
            .await
    }

    async fn apply_early_close(
        &self,
        position: &Position,
        price: Decimal,
        config: &LifecycleConfig,
        execution: &ExecutionManager,
        actions: &mut Vec<LifecycleAction>,
    ) -> Step {
        let rule = &config.ai_close;
        let Some(advisor) = self.advisor.as_ref().filter(|_| rule.enabled) else {
            return Step::Continue;
        };
        if position.profit_pips(price) >= Decimal::ZERO {
            return Step::Continue;
        }

        let probability = match advisor.profit_probability(position, price).await {
            Ok(Some(p)) => p,
            Ok(None) => return Step::Continue,
            Err(e) => {
                warn!(ticket = position.ticket, error = %e, "Exit advisor failed");
                return Step::Continue;
            }
        };
        if probability >= rule.min_profit_probability {
            return Step::Continue;
        }

        info!(
            ticket = position.ticket,
            instrument = %position.instrument,
            probability,
            threshold = rule.min_profit_probability,
            "Closing losing position early"
        );
        let outcome = execution.close_position(position.ticket, None).await;
        record_close(position, LifecycleActionKind::EarlyClose { probability }, outcome, actions)
    }
}

fn record_close(
    position: &Position,
    action: LifecycleActionKind,
    outcome: ExecutionOutcome,
    actions: &mut Vec<LifecycleAction>,
) -> Step {
    let closed = outcome.success;
    if !closed {
        warn!(ticket = position.ticket, error = ?outcome.message, "Close failed, position kept");
    }
    actions.push(LifecycleAction {
        ticket: position.ticket,
        instrument: position.instrument.clone(),
        action,
        outcome: Some(outcome),
    });
    if closed {
        Step::Closed
    } else {
        Step::Continue
    }
}

/// Sends a tightened stop; updates the position only if the broker accepted it.
async fn move_stop(
    position: &mut Position,
    new_stop: Decimal,
    action: LifecycleActionKind,
    execution: &ExecutionManager,
    actions: &mut Vec<LifecycleAction>,
) -> bool {
    let outcome = execution
        .modify_position(position.ticket, Some(new_stop), None)
        .await;
    let accepted = outcome.success;
    if accepted {
        position.current_stop = Some(new_stop);
    }
    actions.push(LifecycleAction {
        ticket: position.ticket,
        instrument: position.instrument.clone(),
        action,
        outcome: Some(outcome),
    });
    accepted
}

async fn apply_breakeven(
    position: &mut Position,
    price: Decimal,
    config: &LifecycleConfig,
    execution: &ExecutionManager,
    actions: &mut Vec<LifecycleAction>,
) {
    let rule = &config.breakeven;
    if !rule.enabled || position.lifecycle.breakeven_applied {
        return;
    }
    if position.profit_pips(price) < rule.trigger_pips {
        return;
    }

    let new_stop = position.entry_price + position.side.sign() * position.spec.pips_to_price(rule.offset_pips);
    if !position.is_tighter_stop(new_stop) {
        position.lifecycle.breakeven_applied = true;
        return;
    }
    info!(ticket = position.ticket, %new_stop, "Moving stop to breakeven");
    if move_stop(position, new_stop, LifecycleActionKind::Breakeven { new_stop }, execution, actions).await {
        position.lifecycle.breakeven_applied = true;
    }
}

async fn apply_trailing(
    position: &mut Position,
    price: Decimal,
    config: &LifecycleConfig,
    execution: &ExecutionManager,
    actions: &mut Vec<LifecycleAction>,
) {
    let rule = &config.trailing;
    if !rule.enabled {
        return;
    }
    let anchor = position.lifecycle.trail_anchor.unwrap_or(position.entry_price);
    let advanced_pips = (price - anchor) * position.side.sign() / position.spec.pip_size;
    if advanced_pips < rule.step_pips {
        return;
    }

    let new_stop = price - position.side.sign() * position.spec.pips_to_price(rule.distance_pips);
    if !position.is_tighter_stop(new_stop) {
        return;
    }
    debug!(ticket = position.ticket, %new_stop, %price, "Trailing stop");
    if move_stop(position, new_stop, LifecycleActionKind::Trail { new_stop }, execution, actions).await {
        position.lifecycle.trail_anchor = Some(price);
    }
}

async fn apply_partial_close(
    position: &mut Position,
    price: Decimal,
    config: &LifecycleConfig,
    execution: &ExecutionManager,
    actions: &mut Vec<LifecycleAction>,
) {
    let rule = &config.partial_close;
    if !rule.enabled || position.lifecycle.partial_closed {
        return;
    }
    if position.profit_pips(price) < rule.trigger_pips {
        return;
    }

    let volume = position.spec.round_down(position.volume * rule.fraction);
    let remainder = position.volume - volume;
    if volume < position.spec.volume_min || remainder < position.spec.volume_min {
        debug!(ticket = position.ticket, %volume, %remainder, "Partial close below minimum volume, skipping");
        position.lifecycle.partial_closed = true;
        actions.push(LifecycleAction {
            ticket: position.ticket,
            instrument: position.instrument.clone(),
            action: LifecycleActionKind::PartialCloseSkipped { volume },
            outcome: None,
        });
        return;
    }

    info!(ticket = position.ticket, %volume, "Partially closing position");
    let outcome = execution.close_position(position.ticket, Some(volume)).await;
    if outcome.success {
        position.volume -= outcome.filled_volume.unwrap_or(volume);
        position.lifecycle.partial_closed = true;
    }
    actions.push(LifecycleAction {
        ticket: position.ticket,
        instrument: position.instrument.clone(),
        action: LifecycleActionKind::PartialClose { volume },
        outcome: Some(outcome),
    });
}
