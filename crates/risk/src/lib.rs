// In crates/risk/src/lib.rs

use core_types::TradeProposal;

pub mod error;
pub mod gate;
pub mod history;
pub mod margin;
pub mod metrics;
pub mod simulator;
pub mod types;

// Re-export public types
pub use error::{Error, Result};
pub use gate::{GateCheck, GateStatistics, PreTradeGate, RejectionReason, ValidationResult};
pub use history::RollingHistory;
pub use margin::{MarginCalculation, MarginSizer};
pub use metrics::{RiskMetrics, RiskMetricsBundle};
pub use simulator::{Forecast, ScenarioSet, ScenarioSimulator};
pub use types::{GatePolicy, MarginSettings, ShockKind, SimulationSettings};

/// The universal interface for a pre-trade validator.
///
/// A `TradeValidator` decides whether a proposed trade may reach the broker.
/// Implementations must fail closed: any internal error yields a rejected
/// `ValidationResult`, never an approval.
pub trait TradeValidator: Send + Sync {
    /// The name of the validator.
    fn name(&self) -> &'static str;

    /// Evaluates a proposal and returns the approve/reject decision with its
    /// diagnostics.
    fn validate(&mut self, proposal: &TradeProposal) -> ValidationResult;

    /// Aggregate approval statistics since construction.
    fn statistics(&self) -> GateStatistics;
}
