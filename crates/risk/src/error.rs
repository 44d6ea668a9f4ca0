// In crates/risk/src/error.rs

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid risk parameters: {0}")]
    InvalidParameters(String),

    #[error("Cannot compute risk metrics from an empty scenario set")]
    EmptyScenarioSet,

    #[error("Non-finite value encountered while computing {metric}")]
    NonFiniteStatistic { metric: &'static str },

    #[error("Invalid trade proposal: {0}")]
    Proposal(#[from] core_types::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
