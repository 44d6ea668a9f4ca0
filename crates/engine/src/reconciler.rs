// In crates/engine/src/reconciler.rs

use crate::broker::BrokerGateway;
use crate::ledger::{PositionLedger, PositionRecord, PositionState};
use crate::Result;
use chrono::{DateTime, Utc};
use core_types::{BrokerPosition, DealId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;

/// The ledger as shared between the engine and the reconciler task.
pub type SharedLedger = Arc<Mutex<PositionLedger>>;

/// A field on which the ledger and the broker disagree for the same deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMismatch {
    pub deal_id: DealId,
    pub internal_state: PositionState,
    /// The broker only ever reports live positions.
    pub broker_state: PositionState,
    pub description: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub timestamp: DateTime<Utc>,
    /// Live (`Open`/`Closing`) records before the pass.
    pub total_internal: usize,
    pub total_broker: usize,
    pub matched_positions: usize,
    /// Broker deals the ledger did not track; adopted as `Open`.
    pub missing_from_internal: Vec<DealId>,
    /// Live ledger records the broker no longer reports.
    pub missing_from_broker: Vec<DealId>,
    pub state_mismatches: Vec<StateMismatch>,
    pub actions_taken: Vec<String>,
    /// Records moved to `Closed` because the broker stopped reporting them.
    pub inferred_closures: Vec<DealId>,
    pub is_synchronized: bool,
}

impl PositionLedger {
    /// Aligns the ledger with the broker's authoritative list.
    ///
    /// Unknown broker deals are adopted, live records missing from the broker
    /// are assumed closed, and matched records get fresh prices. Field
    /// disagreements are reported but never overwrite the ledger. Running the
    /// same snapshot twice leaves the ledger unchanged after the first pass.
    pub fn reconcile(&mut self, broker_positions: &[BrokerPosition]) -> ReconciliationResult {
        let mut broker: BTreeMap<&DealId, &BrokerPosition> = BTreeMap::new();
        for position in broker_positions {
            if broker.insert(&position.deal_id, position).is_some() {
                tracing::warn!(deal_id = %position.deal_id, "Broker reported a deal twice; keeping the last entry");
            }
        }

        let mut internal: Vec<DealId> = self
            .positions
            .iter()
            .filter(|(_, record)| record.state.is_live())
            .map(|(deal_id, _)| deal_id.clone())
            .collect();
        internal.sort();

        let mut result = ReconciliationResult {
            timestamp: Utc::now(),
            total_internal: internal.len(),
            total_broker: broker.len(),
            matched_positions: 0,
            missing_from_internal: Vec::new(),
            missing_from_broker: Vec::new(),
            state_mismatches: Vec::new(),
            actions_taken: Vec::new(),
            inferred_closures: Vec::new(),
            is_synchronized: false,
        };

        // --- 1. Walk the broker's view ---
        for (deal_id, position) in &broker {
            match self.positions.get_mut(*deal_id) {
                Some(record) if record.state.is_live() => {
                    result.matched_positions += 1;
                    refresh_marks(record, position);
                    result.state_mismatches.extend(compare(record, position));
                }
                _ => {
                    let record = adopt(position);
                    tracing::warn!(
                        %deal_id,
                        instrument = %position.instrument,
                        size = %position.size,
                        "Adopting position found on broker but not tracked internally"
                    );
                    result.missing_from_internal.push((*deal_id).clone());
                    result.actions_taken.push(format!("Adopted {} from broker", deal_id));
                    self.positions.insert((*deal_id).clone(), record);
                }
            }
        }

        // --- 2. Walk the ledger's live records ---
        for deal_id in internal {
            if broker.contains_key(&deal_id) {
                continue;
            }
            let Some(record) = self.positions.get_mut(&deal_id) else {
                continue;
            };
            record.close_inferred = true;
            record.close_time = Some(Utc::now());
            record.close_price = record.current_price;
            record.pnl = record.unrealized_pnl.take();
            record.transition(PositionState::Closed, "not found on broker, assumed closed");

            result.actions_taken.push(format!("Marked {} closed (not on broker)", deal_id));
            result.missing_from_broker.push(deal_id.clone());
            result.inferred_closures.push(deal_id);
        }

        result.is_synchronized = result.missing_from_internal.is_empty()
            && result.missing_from_broker.is_empty()
            && result.state_mismatches.is_empty();

        if result.is_synchronized {
            tracing::debug!(matched = result.matched_positions, "Ledger synchronized with broker");
        } else {
            tracing::warn!(
                matched = result.matched_positions,
                adopted = result.missing_from_internal.len(),
                inferred_closed = result.inferred_closures.len(),
                mismatches = result.state_mismatches.len(),
                "Ledger diverged from broker"
            );
        }

        self.history.push(result.clone());
        if let Some(keep) = self.terminal_retention {
            self.prune_terminal(keep);
        }
        result
    }
}

fn adopt(position: &BrokerPosition) -> PositionRecord {
    let now = Utc::now();
    let unrealized_pnl = position.pnl.or_else(|| {
        position
            .current_price
            .map(|price| (price - position.level) * position.size * position.direction.sign())
    });
    PositionRecord {
        deal_id: Some(position.deal_id.clone()),
        correlation_id: None,
        instrument: position.instrument.clone(),
        direction: position.direction,
        size: position.size,
        entry_price: Some(position.level),
        // The broker's list carries no open time.
        entry_time: Some(now),
        state: PositionState::Open,
        broker_confirmed: true,
        current_price: position.current_price,
        unrealized_pnl,
        close_price: None,
        close_time: None,
        pnl: None,
        close_inferred: false,
        note: Some("Adopted from broker".to_string()),
        last_updated: now,
    }
}

fn refresh_marks(record: &mut PositionRecord, position: &BrokerPosition) {
    let Some(price) = position.current_price else {
        return;
    };
    let pnl = position.pnl.or_else(|| record.pnl_at(price));
    if record.current_price != Some(price) || record.unrealized_pnl != pnl {
        record.current_price = Some(price);
        record.unrealized_pnl = pnl;
        record.last_updated = Utc::now();
    }
}

fn compare(record: &PositionRecord, position: &BrokerPosition) -> Vec<StateMismatch> {
    let mut mismatches = Vec::new();
    let mut report = |description: String| {
        mismatches.push(StateMismatch {
            deal_id: position.deal_id.clone(),
            internal_state: record.state,
            broker_state: PositionState::Open,
            description,
        });
    };

    if record.size != position.size {
        report(format!("size: ledger {} vs broker {}", record.size, position.size));
    }
    if record.direction != position.direction {
        report(format!("direction: ledger {} vs broker {}", record.direction, position.direction));
    }
    if record.instrument != position.instrument {
        report(format!(
            "instrument: ledger {} vs broker {}",
            record.instrument, position.instrument
        ));
    }
    if mismatches.is_empty() {
        return mismatches;
    }
    for mismatch in &mismatches {
        tracing::warn!(deal_id = %mismatch.deal_id, description = %mismatch.description, "State mismatch");
    }
    mismatches
}

/// A background task that periodically reconciles the ledger with the
/// positions reported by the broker.
pub struct StateReconciler {
    gateway: Arc<dyn BrokerGateway>,
    ledger: SharedLedger,
    interval: Duration,
}

impl StateReconciler {
    pub fn new(gateway: Arc<dyn BrokerGateway>, ledger: SharedLedger, interval: Duration) -> Self {
        Self {
            gateway,
            ledger,
            interval,
        }
    }

    /// Fetches the broker's positions, then diffs them under the ledger lock.
    pub async fn reconcile_once(&self) -> Result<ReconciliationResult> {
        let positions = self.gateway.fetch_positions().await?;
        let mut ledger = self.ledger.lock().await;
        Ok(ledger.reconcile(&positions))
    }

    /// The main reconciliation loop. Returns when `shutdown` flips to `true`
    /// or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            gateway = self.gateway.name(),
            interval_secs = self.interval.as_secs(),
            "Starting state reconciler"
        );
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::error!(error = %e, "Failed to reconcile state");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("State reconciler stopped");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Sum of unrealized P&L over the ledger's live records.
pub fn open_exposure(ledger: &PositionLedger) -> Decimal {
    ledger
        .positions
        .values()
        .filter(|record| record.state.is_live())
        .filter_map(|record| record.unrealized_pnl)
        .sum()
}
