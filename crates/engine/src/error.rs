// In crates/engine/src/error.rs

use crate::ledger::PositionState;
use core_types::{CorrelationId, DealId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("A position with correlation id {0} is already tracked")]
    DuplicateCorrelationId(CorrelationId),

    #[error("No pending position for correlation id {0}")]
    NoPendingPosition(CorrelationId),

    #[error("Position {0} not found")]
    PositionNotFound(DealId),

    #[error("Position {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: PositionState,
        to: PositionState,
    },

    #[error("Snapshot record is missing its deal id")]
    CorruptSnapshot,

    #[error("Broker rejected the request: {reason}")]
    BrokerRejected { reason: String },

    #[error("Risk configuration error: {0}")]
    Risk(#[from] risk::Error),

    #[error("Invalid trade proposal: {0}")]
    Proposal(#[from] core_types::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
