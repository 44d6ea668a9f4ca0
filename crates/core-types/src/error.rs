// In crates/core-types/src/error.rs

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid trade proposal: {reason}")]
    InvalidProposal { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
