// In crates/engine/src/broker.rs

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{BrokerPosition, CorrelationId, DealId, Direction, Instrument};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

/// An order the engine asks the broker to open.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTicket {
    pub correlation_id: CorrelationId,
    pub instrument: Instrument,
    pub direction: Direction,
    pub size: Decimal,
    /// Price the proposal was evaluated at; used when the broker has no quote.
    pub entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderConfirmation {
    pub correlation_id: CorrelationId,
    pub deal_id: DealId,
    pub level: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseConfirmation {
    pub deal_id: DealId,
    pub close_price: Decimal,
    pub pnl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// The universal interface for a broker connection.
///
/// A `BrokerGateway` resolves all network I/O; the ledger and the risk core only
/// ever see the values it returns.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// The name of the gateway (e.g., "PaperBroker").
    fn name(&self) -> &'static str;

    /// Submits an opening order and waits for the broker's deal confirmation.
    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderConfirmation>;

    /// The broker's current list of open positions.
    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Closes an open position at market.
    async fn close_position(&self, deal_id: &DealId) -> Result<CloseConfirmation>;
}

#[derive(Debug, Default)]
struct PaperState {
    positions: BTreeMap<DealId, BrokerPosition>,
    prices: HashMap<Instrument, Decimal>,
    next_deal: u64,
    reject_next: Option<String>,
}

impl PaperState {
    fn mark(&self, position: &BrokerPosition) -> BrokerPosition {
        let mut marked = position.clone();
        if let Some(price) = self.prices.get(&position.instrument) {
            marked.current_price = Some(*price);
            marked.pnl = Some((*price - position.level) * position.size * position.direction.sign());
        }
        marked
    }
}

/// An in-memory broker that fills every order at the last known price.
///
/// Tests and the paper-trading loop use it to simulate broker-side events
/// (stops hitting, positions opened elsewhere) that reconciliation must absorb.
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, instrument: Instrument, price: Decimal) {
        self.state.lock().await.prices.insert(instrument, price);
    }

    /// Makes the next `place_order` fail with `reason`.
    pub async fn reject_next(&self, reason: impl Into<String>) {
        self.state.lock().await.reject_next = Some(reason.into());
    }

    /// Removes a position without telling the client, as a stop-out would.
    pub async fn drop_position(&self, deal_id: &DealId) -> Option<BrokerPosition> {
        let removed = self.state.lock().await.positions.remove(deal_id);
        if removed.is_some() {
            tracing::info!(%deal_id, "Paper position dropped broker-side");
        }
        removed
    }

    /// Adds a position the client never ordered.
    pub async fn inject_position(&self, position: BrokerPosition) {
        let mut state = self.state.lock().await;
        state.positions.insert(position.deal_id.clone(), position);
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    fn name(&self) -> &'static str {
        "PaperBroker"
    }

    async fn place_order(&self, ticket: &OrderTicket) -> Result<OrderConfirmation> {
        let mut state = self.state.lock().await;
        if let Some(reason) = state.reject_next.take() {
            tracing::warn!(correlation_id = %ticket.correlation_id, %reason, "Paper order rejected");
            return Err(Error::BrokerRejected { reason });
        }

        state.next_deal += 1;
        let deal_id = DealId(format!("PAPER-{:06}", state.next_deal));
        let level = state
            .prices
            .get(&ticket.instrument)
            .copied()
            .unwrap_or(ticket.entry_price);

        state.positions.insert(
            deal_id.clone(),
            BrokerPosition {
                deal_id: deal_id.clone(),
                instrument: ticket.instrument.clone(),
                direction: ticket.direction,
                size: ticket.size,
                level,
                current_price: Some(level),
                pnl: Some(Decimal::ZERO),
            },
        );
        tracing::debug!(correlation_id = %ticket.correlation_id, %deal_id, %level, "Paper order filled");

        Ok(OrderConfirmation {
            correlation_id: ticket.correlation_id.clone(),
            deal_id,
            level,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>> {
        let state = self.state.lock().await;
        Ok(state.positions.values().map(|p| state.mark(p)).collect())
    }

    async fn close_position(&self, deal_id: &DealId) -> Result<CloseConfirmation> {
        let mut state = self.state.lock().await;
        let position = state
            .positions
            .remove(deal_id)
            .ok_or_else(|| Error::PositionNotFound(deal_id.clone()))?;
        let marked = state.mark(&position);

        Ok(CloseConfirmation {
            deal_id: deal_id.clone(),
            close_price: marked.current_price.unwrap_or(position.level),
            pnl: marked.pnl.unwrap_or(Decimal::ZERO),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticket(id: &str) -> OrderTicket {
        OrderTicket {
            correlation_id: CorrelationId(id.to_string()),
            instrument: Instrument("IX.D.FTSE.DAILY.IP".to_string()),
            direction: Direction::Short,
            size: dec!(2),
            entry_price: dec!(7500),
        }
    }

    #[tokio::test]
    async fn fills_and_marks_positions() {
        let broker = PaperBroker::new();
        let confirmation = broker.place_order(&ticket("REF1")).await.unwrap();
        assert_eq!(confirmation.level, dec!(7500));

        broker
            .set_price(Instrument("IX.D.FTSE.DAILY.IP".to_string()), dec!(7490))
            .await;
        let positions = broker.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].pnl, Some(dec!(20)));

        let closed = broker.close_position(&confirmation.deal_id).await.unwrap();
        assert_eq!(closed.close_price, dec!(7490));
        assert_eq!(closed.pnl, dec!(20));
        assert!(broker.fetch_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_applies_to_one_order() {
        let broker = PaperBroker::new();
        broker.reject_next("MARKET_CLOSED").await;
        assert!(matches!(
            broker.place_order(&ticket("REF1")).await,
            Err(Error::BrokerRejected { .. })
        ));
        assert!(broker.place_order(&ticket("REF2")).await.is_ok());
    }

    #[tokio::test]
    async fn closing_unknown_deal_fails() {
        let broker = PaperBroker::new();
        let result = broker.close_position(&DealId("NOPE".to_string())).await;
        assert!(matches!(result, Err(Error::PositionNotFound(_))));
    }
}
