// In crates/engine/src/lib.rs

pub mod broker;
pub mod error;
pub mod ledger;
pub mod reconciler;

use crate::broker::{BrokerGateway, CloseConfirmation, OrderTicket};
use crate::reconciler::{open_exposure, ReconciliationResult, SharedLedger, StateReconciler};
use app_config::Settings;
use chrono::Utc;
use core_types::{CorrelationId, DealId, TradeProposal};
use risk::{GateStatistics, MarginCalculation, MarginSizer, PreTradeGate, TradeValidator, ValidationResult};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// Re-export public types
pub use error::{Error, Result};
pub use ledger::{LedgerSnapshot, LedgerSummary, PositionKey, PositionLedger, PositionRecord, PositionState};

/// A trade the host wants to open, with the broker's margin figures.
///
/// The proposal's size is the most the caller is willing to trade; the engine
/// may only shrink it.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub proposal: TradeProposal,
    pub available_margin: Decimal,
    pub margin_per_unit: Decimal,
}

/// What happened to a [`TradeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome")]
pub enum TradeDecision {
    /// No viable size fits the available margin.
    MarginBlocked { calculation: MarginCalculation },
    /// The pre-trade gate refused the sized proposal.
    Rejected { validation: ValidationResult },
    /// The broker accepted the order and it is tracked as `Open`.
    Submitted {
        correlation_id: CorrelationId,
        deal_id: DealId,
        size: Decimal,
        level: Decimal,
        validation: ValidationResult,
    },
    /// The broker refused the order; the ledger holds it as `Rejected`.
    BrokerRejected {
        correlation_id: CorrelationId,
        reason: String,
    },
}

/// Final state handed back by [`Engine::shutdown`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub gate: GateStatistics,
    pub ledger: LedgerSummary,
    pub open_exposure: Decimal,
    pub snapshot: LedgerSnapshot,
}

/// The orchestrator for one trading account: sizes, validates, submits and
/// tracks trades, and hands out the reconciliation task.
pub struct Engine {
    sizer: MarginSizer,
    validator: Box<dyn TradeValidator>,
    ledger: SharedLedger,
    gateway: Arc<dyn BrokerGateway>,
    reconcile_interval: Duration,
    order_seq: u64,
}

impl Engine {
    pub fn new(settings: &Settings, gateway: Arc<dyn BrokerGateway>) -> Result<Self> {
        let ledger = PositionLedger::new(settings.ledger.history_capacity)
            .with_terminal_retention(settings.ledger.terminal_retention);
        Self::with_ledger(settings, gateway, ledger)
    }

    /// Builds an engine around an existing ledger, e.g. one restored from a
    /// snapshot.
    pub fn with_ledger(
        settings: &Settings,
        gateway: Arc<dyn BrokerGateway>,
        ledger: PositionLedger,
    ) -> Result<Self> {
        tracing::info!(gateway = gateway.name(), "Initializing risk engine...");

        let sizer = MarginSizer::new(&settings.margin)?;
        let validator = Box::new(PreTradeGate::new(
            settings.gate.clone(),
            settings.simulation.clone(),
        )?);

        Ok(Self {
            sizer,
            validator,
            ledger: Arc::new(Mutex::new(ledger)),
            gateway,
            reconcile_interval: Duration::from_secs(settings.ledger.reconcile_interval_secs),
            order_seq: 0,
        })
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    pub fn statistics(&self) -> GateStatistics {
        self.validator.statistics()
    }

    /// The periodic reconciliation task for this engine's ledger.
    pub fn reconciler(&self) -> StateReconciler {
        StateReconciler::new(self.gateway.clone(), self.ledger.clone(), self.reconcile_interval)
    }

    pub async fn reconcile_once(&self) -> Result<ReconciliationResult> {
        self.reconciler().reconcile_once().await
    }

    /// Runs one trade through sizing, validation and submission.
    pub async fn execute_trade(&mut self, request: &TradeRequest) -> Result<TradeDecision> {
        let proposal = &request.proposal;

        // --- 1. Size against available margin ---
        let calculation = self.sizer.size_capped(
            request.available_margin,
            request.margin_per_unit,
            proposal.size(),
        );
        if calculation.is_blocked {
            tracing::warn!(
                instrument = %proposal.instrument(),
                reason = calculation.block_reason.as_deref().unwrap_or_default(),
                "Trade blocked by margin sizing"
            );
            return Ok(TradeDecision::MarginBlocked { calculation });
        }
        let sized = proposal.resized(calculation.safe_units)?;

        // --- 2. Pre-trade validation ---
        let validation = self.validator.validate(&sized);
        if !validation.approved {
            return Ok(TradeDecision::Rejected { validation });
        }

        // --- 3. Submit and track ---
        let correlation_id = self.next_correlation_id();
        self.ledger.lock().await.add_pending(
            correlation_id.clone(),
            sized.instrument().clone(),
            sized.direction(),
            sized.size(),
        )?;

        let ticket = OrderTicket {
            correlation_id: correlation_id.clone(),
            instrument: sized.instrument().clone(),
            direction: sized.direction(),
            size: sized.size(),
            entry_price: sized.entry_price(),
        };

        match self.gateway.place_order(&ticket).await {
            Ok(confirmation) => {
                self.ledger.lock().await.confirm_opened(
                    &correlation_id,
                    confirmation.deal_id.clone(),
                    confirmation.level,
                    Some(confirmation.timestamp),
                )?;
                Ok(TradeDecision::Submitted {
                    correlation_id,
                    deal_id: confirmation.deal_id,
                    size: sized.size(),
                    level: confirmation.level,
                    validation,
                })
            }
            Err(Error::BrokerRejected { reason }) => {
                self.ledger.lock().await.mark_rejected(&correlation_id, &reason)?;
                Ok(TradeDecision::BrokerRejected {
                    correlation_id,
                    reason,
                })
            }
            // The order may or may not have reached the broker; the pending
            // record stays until reconciliation or a late confirmation.
            Err(e) => Err(e),
        }
    }

    /// Closes a tracked position at market.
    pub async fn close_trade(&self, deal_id: &DealId) -> Result<CloseConfirmation> {
        self.ledger.lock().await.mark_closing(deal_id)?;

        let confirmation = self.gateway.close_position(deal_id).await?;
        self.ledger.lock().await.confirm_closed(
            deal_id,
            confirmation.close_price,
            confirmation.pnl,
            Some(confirmation.timestamp),
        )?;
        Ok(confirmation)
    }

    fn next_correlation_id(&mut self) -> CorrelationId {
        self.order_seq += 1;
        CorrelationId(format!("RC-{}-{:04}", Utc::now().timestamp_millis(), self.order_seq))
    }

    /// Stops the engine and returns its final state.
    pub async fn shutdown(self) -> EngineReport {
        let gate = self.validator.statistics();
        let (summary, exposure, snapshot) = match Arc::try_unwrap(self.ledger) {
            Ok(ledger) => {
                let ledger = ledger.into_inner();
                (ledger.summary(), open_exposure(&ledger), ledger.shutdown())
            }
            // A reconciler task still holds the ledger.
            Err(shared) => {
                let ledger = shared.lock().await;
                (ledger.summary(), open_exposure(&ledger), ledger.snapshot())
            }
        };

        tracing::info!(
            approved = gate.approved_trades,
            blocked = gate.blocked_trades,
            open = summary.open,
            "Risk engine shut down"
        );

        EngineReport {
            gate,
            ledger: summary,
            open_exposure: exposure,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use core_types::{Direction, Instrument, MarketContext};
    use risk::{GatePolicy, RejectionReason};
    use rust_decimal_macros::dec;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.simulation.n_simulations = 2_000;
        settings
    }

    fn request(base_prediction: f64, volatility: f64, size: Decimal) -> TradeRequest {
        let proposal = TradeProposal::new(
            Instrument("CS.D.GBPUSD.TODAY.IP".to_string()),
            Direction::Long,
            size,
            dec!(1.2650),
            0.9,
        )
        .unwrap()
        .with_market_context(MarketContext {
            base_prediction: Some(base_prediction),
            volatility: Some(volatility),
            instrument_class: None,
        });
        TradeRequest {
            proposal,
            available_margin: dec!(264.63),
            margin_per_unit: dec!(3.33),
        }
    }

    #[tokio::test]
    async fn approved_trade_is_sized_submitted_and_tracked() {
        let broker = Arc::new(PaperBroker::new());
        let mut engine = Engine::new(&settings(), broker.clone()).unwrap();

        let decision = engine.execute_trade(&request(3.0, 0.005, dec!(500))).await.unwrap();

        let TradeDecision::Submitted { deal_id, size, .. } = decision else {
            panic!("expected submission, got {:?}", decision);
        };
        assert_eq!(size, dec!(66.2));
        let ledger = engine.ledger();
        let record = ledger.lock().await.get(&deal_id).cloned().unwrap();
        assert_eq!(record.state, PositionState::Open);
        assert_eq!(record.size, dec!(66.2));
        assert_eq!(broker.fetch_positions().await.unwrap().len(), 1);

        assert!(engine.reconcile_once().await.unwrap().is_synchronized);
    }

    #[tokio::test]
    async fn requested_size_caps_the_margin_size() {
        let mut engine = Engine::new(&settings(), Arc::new(PaperBroker::new())).unwrap();
        let decision = engine.execute_trade(&request(3.0, 0.005, dec!(2))).await.unwrap();
        assert!(matches!(decision, TradeDecision::Submitted { size, .. } if size == dec!(2)));
    }

    #[tokio::test]
    async fn configured_max_units_caps_submitted_size() {
        let mut settings = settings();
        settings.margin.max_units = Some(5.0);
        let broker = Arc::new(PaperBroker::new());
        let mut engine = Engine::new(&settings, broker.clone()).unwrap();

        let decision = engine.execute_trade(&request(3.0, 0.005, dec!(500))).await.unwrap();

        let TradeDecision::Submitted { size, .. } = decision else {
            panic!("expected submission, got {:?}", decision);
        };
        assert_eq!(size, dec!(5));
        let positions = broker.fetch_positions().await.unwrap();
        assert_eq!(positions[0].size, dec!(5));
    }

    #[tokio::test]
    async fn insufficient_margin_blocks_before_validation() {
        let mut engine = Engine::new(&settings(), Arc::new(PaperBroker::new())).unwrap();
        let mut request = request(3.0, 0.005, dec!(1));
        request.available_margin = dec!(0.05);
        request.margin_per_unit = dec!(3.0);

        let decision = engine.execute_trade(&request).await.unwrap();

        assert!(matches!(decision, TradeDecision::MarginBlocked { ref calculation } if calculation.safe_units.is_zero()));
        assert_eq!(engine.statistics().total_validations, 0);
    }

    #[tokio::test]
    async fn gate_rejection_never_reaches_the_broker() {
        let broker = Arc::new(PaperBroker::new());
        let mut engine = Engine::new(&settings(), broker.clone()).unwrap();

        let decision = engine.execute_trade(&request(0.0, 0.05, dec!(1))).await.unwrap();

        let TradeDecision::Rejected { validation } = decision else {
            panic!("expected rejection");
        };
        assert!(matches!(validation.rejection_reason, Some(RejectionReason::GatesFailed { .. })));
        assert!(broker.fetch_positions().await.unwrap().is_empty());
        assert_eq!(engine.ledger().lock().await.summary(), LedgerSummary::default());
    }

    #[tokio::test]
    async fn broker_rejection_is_recorded() {
        let broker = Arc::new(PaperBroker::new());
        let mut settings = settings();
        settings.gate = GatePolicy {
            enabled: false,
            ..GatePolicy::default()
        };
        let mut engine = Engine::new(&settings, broker.clone()).unwrap();
        broker.reject_next("INSUFFICIENT_FUNDS").await;

        let decision = engine.execute_trade(&request(0.0, 0.05, dec!(1))).await.unwrap();

        assert!(matches!(decision, TradeDecision::BrokerRejected { ref reason, .. } if reason == "INSUFFICIENT_FUNDS"));
        assert_eq!(engine.ledger().lock().await.summary().rejected, 1);
    }

    #[tokio::test]
    async fn close_and_shutdown_report() {
        let broker = Arc::new(PaperBroker::new());
        let mut engine = Engine::new(&settings(), broker.clone()).unwrap();
        let TradeDecision::Submitted { deal_id, .. } =
            engine.execute_trade(&request(3.0, 0.005, dec!(10))).await.unwrap()
        else {
            panic!("expected submission");
        };

        broker
            .set_price(Instrument("CS.D.GBPUSD.TODAY.IP".to_string()), dec!(1.2700))
            .await;
        let closed = engine.close_trade(&deal_id).await.unwrap();
        assert_eq!(closed.pnl, dec!(0.0500));

        let report = engine.shutdown().await;
        assert_eq!(report.ledger.closed, 1);
        assert_eq!(report.gate.approved_trades, 1);
        assert_eq!(report.open_exposure, Decimal::ZERO);
        assert_eq!(report.snapshot.positions.len(), 1);
    }
}
