// In crates/engine/src/ledger.rs

use crate::reconciler::ReconciliationResult;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use core_types::{CorrelationId, DealId, Direction, Instrument};
use risk::RollingHistory;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a tracked position.
///
/// `Pending -> Open -> Closing -> Closed`, `Pending -> Rejected`, and
/// `Open -> Closed` when reconciliation infers a close. `Closed` and
/// `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionState {
    Pending,
    Open,
    Closing,
    Closed,
    Rejected,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Rejected)
    }

    /// States the broker is expected to report as a live position.
    pub fn is_live(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::Closing)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionState::Pending => "PENDING",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
            PositionState::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// How a caller refers to a ledger entry: by correlation id until the broker
/// confirms, by deal id afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionKey {
    Pending(CorrelationId),
    Deal(DealId),
}

/// The ledger's view of a single position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Broker-assigned id; `None` while pending or after rejection.
    pub deal_id: Option<DealId>,
    /// Client-generated id of the opening order, if this client opened it.
    pub correlation_id: Option<CorrelationId>,
    pub instrument: Instrument,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub entry_time: Option<DateTime<Utc>>,
    pub state: PositionState,
    pub broker_confirmed: bool,
    pub current_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    /// Realized P&L once closed.
    pub pnl: Option<Decimal>,
    /// True when the close was inferred from the broker no longer reporting
    /// the position.
    pub close_inferred: bool,
    /// Reason attached to the most recent transition.
    pub note: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl PositionRecord {
    pub(crate) fn label(&self) -> String {
        match (&self.deal_id, &self.correlation_id) {
            (Some(deal_id), _) => deal_id.0.clone(),
            (None, Some(correlation_id)) => format!("PENDING_{}", correlation_id),
            (None, None) => "UNKNOWN".to_string(),
        }
    }

    pub(crate) fn transition(&mut self, to: PositionState, reason: &str) {
        let from = self.state;
        self.state = to;
        self.last_updated = Utc::now();
        if !reason.is_empty() {
            self.note = Some(reason.to_string());
        }
        tracing::info!(position = %self.label(), %from, %to, reason, "Position state changed");
    }

    /// Mark-to-market P&L at `price`. `None` until the entry price is known.
    pub fn pnl_at(&self, price: Decimal) -> Option<Decimal> {
        self.entry_price
            .map(|entry| (price - entry) * self.size * self.direction.sign())
    }
}

/// Count of records per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub pending: usize,
    pub open: usize,
    pub closing: usize,
    pub closed: usize,
    pub rejected: usize,
}

/// Durable form of the ledger's live state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub pending: Vec<PositionRecord>,
    pub positions: Vec<PositionRecord>,
}

/// Authoritative client-side bookkeeping of positions.
///
/// Pending orders are keyed by correlation id and re-keyed by deal id when the
/// broker confirms them. The ledger is not internally synchronized: hosts that
/// share it between tasks must serialize every mutation and reconciliation
/// pass behind one lock (see [`crate::reconciler::SharedLedger`]).
#[derive(Debug)]
pub struct PositionLedger {
    pub(crate) pending: HashMap<CorrelationId, PositionRecord>,
    pub(crate) positions: HashMap<DealId, PositionRecord>,
    pub(crate) history: RollingHistory<ReconciliationResult>,
    /// Closed and rejected records kept after each reconciliation pass.
    /// `None` keeps them all.
    pub(crate) terminal_retention: Option<usize>,
}

impl PositionLedger {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            positions: HashMap::new(),
            history: RollingHistory::new(history_capacity),
            terminal_retention: None,
        }
    }

    /// Bounds the number of closed and rejected records the ledger carries.
    /// Older ones are evicted at the end of every reconciliation pass.
    pub fn with_terminal_retention(mut self, keep: usize) -> Self {
        self.terminal_retention = Some(keep);
        self
    }

    /// Rebuilds a ledger from a snapshot taken by [`PositionLedger::snapshot`].
    pub fn from_snapshot(snapshot: LedgerSnapshot, history_capacity: usize) -> Result<Self> {
        let mut ledger = Self::new(history_capacity);
        for record in snapshot.pending {
            let correlation_id = record.correlation_id.clone().ok_or(Error::CorruptSnapshot)?;
            ledger.pending.insert(correlation_id, record);
        }
        for record in snapshot.positions {
            let deal_id = record.deal_id.clone().ok_or(Error::CorruptSnapshot)?;
            ledger.positions.insert(deal_id, record);
        }
        tracing::info!(
            pending = ledger.pending.len(),
            positions = ledger.positions.len(),
            "Position ledger restored from snapshot"
        );
        Ok(ledger)
    }

    // --- State machine operations ---

    /// Records a submitted order that the broker has not confirmed yet.
    pub fn add_pending(
        &mut self,
        correlation_id: CorrelationId,
        instrument: Instrument,
        direction: Direction,
        size: Decimal,
    ) -> Result<PositionKey> {
        if self.pending.contains_key(&correlation_id) {
            tracing::error!(%correlation_id, "Duplicate pending position");
            return Err(Error::DuplicateCorrelationId(correlation_id));
        }

        let record = PositionRecord {
            deal_id: None,
            correlation_id: Some(correlation_id.clone()),
            instrument,
            direction,
            size,
            entry_price: None,
            entry_time: None,
            state: PositionState::Pending,
            broker_confirmed: false,
            current_price: None,
            unrealized_pnl: None,
            close_price: None,
            close_time: None,
            pnl: None,
            close_inferred: false,
            note: None,
            last_updated: Utc::now(),
        };
        tracing::info!(
            %correlation_id,
            instrument = %record.instrument,
            direction = %record.direction,
            size = %record.size,
            "Added pending position"
        );
        self.pending.insert(correlation_id.clone(), record);
        Ok(PositionKey::Pending(correlation_id))
    }

    /// Moves a pending order to `Open` under the broker-assigned `deal_id`.
    ///
    /// If reconciliation already adopted `deal_id` from the broker, the pending
    /// record is folded into the adopted one so the position is tracked once.
    pub fn confirm_opened(
        &mut self,
        correlation_id: &CorrelationId,
        deal_id: DealId,
        entry_price: Decimal,
        entry_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let Some(pending) = self.pending.get(correlation_id) else {
            tracing::error!(%correlation_id, "Cannot confirm position: no pending position");
            return Err(Error::NoPendingPosition(correlation_id.clone()));
        };
        if pending.state != PositionState::Pending {
            tracing::error!(%correlation_id, state = %pending.state, "Cannot confirm a non-pending order");
            return Err(Error::InvalidTransition {
                id: pending.label(),
                from: pending.state,
                to: PositionState::Open,
            });
        }

        if let Some(existing) = self.positions.get_mut(&deal_id) {
            if !existing.state.is_live() {
                tracing::error!(%deal_id, state = %existing.state, "Deal id already used by a finished position");
                return Err(Error::InvalidTransition {
                    id: deal_id.0.clone(),
                    from: existing.state,
                    to: PositionState::Open,
                });
            }
            tracing::warn!(
                %correlation_id,
                %deal_id,
                "Confirmation for a position already adopted from the broker; merging"
            );
            existing.correlation_id = Some(correlation_id.clone());
            existing.entry_price = Some(entry_price);
            if let Some(time) = entry_time {
                existing.entry_time = Some(time);
            }
            existing.last_updated = Utc::now();
            self.pending.remove(correlation_id);
            return Ok(());
        }

        let Some(mut record) = self.pending.remove(correlation_id) else {
            return Err(Error::NoPendingPosition(correlation_id.clone()));
        };
        record.deal_id = Some(deal_id.clone());
        record.entry_price = Some(entry_price);
        record.entry_time = Some(entry_time.unwrap_or_else(Utc::now));
        record.broker_confirmed = true;
        record.transition(PositionState::Open, &format!("Confirmed by broker @ {}", entry_price));

        tracing::info!(%correlation_id, %deal_id, %entry_price, "Position confirmed");
        self.positions.insert(deal_id, record);
        Ok(())
    }

    /// Records that the broker refused the order.
    pub fn mark_rejected(&mut self, correlation_id: &CorrelationId, reason: &str) -> Result<()> {
        let Some(record) = self.pending.get_mut(correlation_id) else {
            tracing::error!(%correlation_id, "Cannot reject: no pending position");
            return Err(Error::NoPendingPosition(correlation_id.clone()));
        };
        if record.state != PositionState::Pending {
            return Err(Error::InvalidTransition {
                id: record.label(),
                from: record.state,
                to: PositionState::Rejected,
            });
        }
        record.transition(PositionState::Rejected, reason);
        Ok(())
    }

    /// Records that a close order was submitted.
    pub fn mark_closing(&mut self, deal_id: &DealId) -> Result<()> {
        let record = self.live_record(deal_id, PositionState::Closing)?;
        if record.state != PositionState::Open {
            let from = record.state;
            tracing::error!(%deal_id, %from, "Cannot mark closing");
            return Err(Error::InvalidTransition {
                id: deal_id.0.clone(),
                from,
                to: PositionState::Closing,
            });
        }
        record.transition(PositionState::Closing, "Close order submitted");
        Ok(())
    }

    /// Records the broker's close confirmation.
    pub fn confirm_closed(
        &mut self,
        deal_id: &DealId,
        close_price: Decimal,
        pnl: Decimal,
        close_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let record = self.live_record(deal_id, PositionState::Closed)?;
        record.close_price = Some(close_price);
        record.close_time = Some(close_time.unwrap_or_else(Utc::now));
        record.pnl = Some(pnl);
        record.unrealized_pnl = None;
        record.transition(
            PositionState::Closed,
            &format!("Closed @ {}, P&L: {:.2}", close_price, pnl),
        );
        Ok(())
    }

    /// Looks up a record that must currently be `Open` or `Closing`.
    fn live_record(&mut self, deal_id: &DealId, to: PositionState) -> Result<&mut PositionRecord> {
        match self.positions.get_mut(deal_id) {
            None => {
                tracing::error!(%deal_id, %to, "Position not found");
                Err(Error::PositionNotFound(deal_id.clone()))
            }
            Some(record) if !record.state.is_live() => {
                tracing::error!(%deal_id, from = %record.state, %to, "Invalid position transition");
                Err(Error::InvalidTransition {
                    id: deal_id.0.clone(),
                    from: record.state,
                    to,
                })
            }
            Some(record) => Ok(record),
        }
    }

    /// Drops all but the `keep` most recently updated terminal records.
    /// Live and pending records are never touched. Returns how many were
    /// removed.
    pub fn prune_terminal(&mut self, keep: usize) -> usize {
        let mut terminal: Vec<(DateTime<Utc>, PositionKey)> = self
            .pending
            .iter()
            .filter(|(_, r)| r.state.is_terminal())
            .map(|(id, r)| (r.last_updated, PositionKey::Pending(id.clone())))
            .chain(
                self.positions
                    .iter()
                    .filter(|(_, r)| r.state.is_terminal())
                    .map(|(id, r)| (r.last_updated, PositionKey::Deal(id.clone()))),
            )
            .collect();
        if terminal.len() <= keep {
            return 0;
        }

        // Newest first; ties resolved by key so eviction is deterministic.
        terminal.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let evicted = terminal.split_off(keep);
        for (_, key) in &evicted {
            match key {
                PositionKey::Pending(id) => self.pending.remove(id),
                PositionKey::Deal(id) => self.positions.remove(id),
            };
        }
        tracing::info!(evicted = evicted.len(), kept = keep, "Pruned terminal positions");
        evicted.len()
    }

    // --- Queries ---

    pub fn get(&self, deal_id: &DealId) -> Option<&PositionRecord> {
        self.positions.get(deal_id)
    }

    pub fn pending(&self, correlation_id: &CorrelationId) -> Option<&PositionRecord> {
        self.pending.get(correlation_id)
    }

    /// Positions in the `Open` state.
    pub fn open_positions(&self) -> Vec<&PositionRecord> {
        self.positions
            .values()
            .filter(|p| p.state == PositionState::Open)
            .collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for record in self.pending.values().chain(self.positions.values()) {
            match record.state {
                PositionState::Pending => summary.pending += 1,
                PositionState::Open => summary.open += 1,
                PositionState::Closing => summary.closing += 1,
                PositionState::Closed => summary.closed += 1,
                PositionState::Rejected => summary.rejected += 1,
            }
        }
        summary
    }

    /// Reconciliation audit trail, oldest first.
    pub fn history(&self) -> &RollingHistory<ReconciliationResult> {
        &self.history
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut pending: Vec<_> = self.pending.values().cloned().collect();
        let mut positions: Vec<_> = self.positions.values().cloned().collect();
        pending.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        positions.sort_by(|a, b| a.deal_id.cmp(&b.deal_id));
        LedgerSnapshot { pending, positions }
    }

    /// Ends the ledger's lifecycle and hands back its durable state.
    pub fn shutdown(self) -> LedgerSnapshot {
        let summary = self.summary();
        tracing::info!(?summary, reconciliations = self.history.len(), "Position ledger shut down");
        self.snapshot()
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn corr(id: &str) -> CorrelationId {
        CorrelationId(id.to_string())
    }

    fn deal(id: &str) -> DealId {
        DealId(id.to_string())
    }

    fn ledger_with_pending(id: &str) -> PositionLedger {
        let mut ledger = PositionLedger::default();
        ledger
            .add_pending(
                corr(id),
                Instrument("CS.D.GBPUSD.TODAY.IP".to_string()),
                Direction::Long,
                dec!(1.5),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn full_lifecycle_re_keys_and_closes() {
        let mut ledger = ledger_with_pending("REF1");
        assert_eq!(ledger.summary().pending, 1);

        ledger.confirm_opened(&corr("REF1"), deal("DEAL1"), dec!(1.2650), None).unwrap();
        assert!(ledger.pending(&corr("REF1")).is_none());
        let record = ledger.get(&deal("DEAL1")).unwrap();
        assert_eq!(record.state, PositionState::Open);
        assert!(record.broker_confirmed);
        assert_eq!(record.correlation_id, Some(corr("REF1")));

        ledger.mark_closing(&deal("DEAL1")).unwrap();
        ledger.confirm_closed(&deal("DEAL1"), dec!(1.2700), dec!(0.75), None).unwrap();

        let record = ledger.get(&deal("DEAL1")).unwrap();
        assert_eq!(record.state, PositionState::Closed);
        assert_eq!(record.pnl, Some(dec!(0.75)));
        assert!(!record.close_inferred);
        assert_eq!(ledger.summary().closed, 1);
    }

    #[test]
    fn pruning_keeps_newest_terminal_records_and_all_live_ones() {
        let mut ledger = ledger_with_pending("REF1");
        for id in ["REF2", "REF3", "REF4"] {
            ledger
                .add_pending(corr(id), Instrument("CS.D.GBPUSD.TODAY.IP".to_string()), Direction::Long, dec!(1))
                .unwrap();
        }
        ledger.mark_rejected(&corr("REF1"), "insufficient funds").unwrap();
        for (reference, deal_id) in [("REF2", "OLD"), ("REF3", "NEW")] {
            ledger.confirm_opened(&corr(reference), deal(deal_id), dec!(1.2650), None).unwrap();
            ledger.confirm_closed(&deal(deal_id), dec!(1.27), dec!(0.5), None).unwrap();
        }
        ledger.positions.get_mut(&deal("OLD")).unwrap().last_updated -= chrono::Duration::minutes(5);
        ledger.pending.get_mut(&corr("REF1")).unwrap().last_updated -= chrono::Duration::minutes(10);

        assert_eq!(ledger.prune_terminal(5), 0);
        assert_eq!(ledger.prune_terminal(1), 2);

        assert!(ledger.get(&deal("NEW")).is_some());
        assert!(ledger.get(&deal("OLD")).is_none());
        assert!(ledger.pending(&corr("REF1")).is_none());
        assert_eq!(ledger.pending(&corr("REF4")).unwrap().state, PositionState::Pending);
        assert_eq!(ledger.summary().closed, 1);
    }

    #[test]
    fn confirming_unknown_order_is_an_error() {
        let mut ledger = PositionLedger::default();
        let result = ledger.confirm_opened(&corr("NOPE"), deal("D"), dec!(1), None);
        assert_eq!(result, Err(Error::NoPendingPosition(corr("NOPE"))));
        assert_eq!(ledger.summary(), LedgerSummary::default());
    }

    #[test]
    fn duplicate_correlation_id_is_refused() {
        let mut ledger = ledger_with_pending("REF1");
        let again = ledger.add_pending(
            corr("REF1"),
            Instrument("X".to_string()),
            Direction::Short,
            dec!(1),
        );
        assert!(matches!(again, Err(Error::DuplicateCorrelationId(_))));
    }

    #[test]
    fn rejected_order_is_terminal() {
        let mut ledger = ledger_with_pending("REF1");
        ledger.mark_rejected(&corr("REF1"), "INSUFFICIENT_FUNDS").unwrap();
        assert_eq!(ledger.pending(&corr("REF1")).unwrap().state, PositionState::Rejected);

        let confirm = ledger.confirm_opened(&corr("REF1"), deal("D"), dec!(1), None);
        assert!(matches!(confirm, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn closing_requires_an_open_position() {
        let mut ledger = PositionLedger::default();
        assert_eq!(
            ledger.mark_closing(&deal("GHOST")),
            Err(Error::PositionNotFound(deal("GHOST")))
        );
        assert!(ledger.confirm_closed(&deal("GHOST"), dec!(1), dec!(0), None).is_err());

        let mut ledger = ledger_with_pending("REF1");
        ledger.confirm_opened(&corr("REF1"), deal("DEAL1"), dec!(1.2650), None).unwrap();
        ledger.confirm_closed(&deal("DEAL1"), dec!(1.26), dec!(-0.75), None).unwrap();
        assert!(matches!(
            ledger.mark_closing(&deal("DEAL1")),
            Err(Error::InvalidTransition { from: PositionState::Closed, .. })
        ));
    }

    #[test]
    fn pnl_follows_direction() {
        let mut ledger = ledger_with_pending("REF1");
        ledger.confirm_opened(&corr("REF1"), deal("DEAL1"), dec!(100), None).unwrap();
        let record = ledger.get(&deal("DEAL1")).unwrap();
        assert_eq!(record.pnl_at(dec!(102)), Some(dec!(3.0)));

        let mut short = record.clone();
        short.direction = Direction::Short;
        assert_eq!(short.pnl_at(dec!(102)), Some(dec!(-3.0)));
    }

    #[test]
    fn snapshot_round_trips_live_state() {
        let mut ledger = ledger_with_pending("REF1");
        ledger
            .add_pending(corr("REF2"), Instrument("IX.D.FTSE.DAILY.IP".to_string()), Direction::Short, dec!(2))
            .unwrap();
        ledger.confirm_opened(&corr("REF1"), deal("DEAL1"), dec!(1.2650), None).unwrap();

        let json = serde_json::to_string(&ledger.snapshot()).unwrap();
        let snapshot: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        let restored = PositionLedger::from_snapshot(snapshot, 10).unwrap();

        assert_eq!(restored.summary(), ledger.summary());
        assert_eq!(restored.get(&deal("DEAL1")), ledger.get(&deal("DEAL1")));
        assert_eq!(ledger.shutdown(), restored.snapshot());
    }
}
