// In crates/app-config/src/types.rs

use risk::{GatePolicy, MarginSettings, SimulationSettings};
use serde::{Deserialize, Serialize};

/// The full, typed application configuration.
///
/// Every section is optional in the sources; missing keys fall back to the
/// documented defaults and unknown keys are rejected.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// The application's general settings.
    pub app: AppSettings,
    /// Monte Carlo scenario generation.
    pub simulation: SimulationSettings,
    /// Thresholds for the pre-trade gate.
    pub gate: GatePolicy,
    /// Margin-safe position sizing.
    pub margin: MarginSettings,
    /// Position ledger and reconciliation cadence.
    pub ledger: LedgerSettings,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct AppSettings {
    /// The environment the application is running in (e.g., "development", "production").
    pub environment: String,
    /// The log level for the application.
    pub log_level: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LedgerSettings {
    /// Reconciliation results kept for audit.
    pub history_capacity: usize,
    /// Closed and rejected positions kept after each reconciliation pass.
    pub terminal_retention: usize,
    /// Seconds between background reconciliation passes.
    pub reconcile_interval_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
            terminal_retention: 500,
            reconcile_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> risk::Result<()> {
        self.simulation.validate()?;
        self.gate.validate()?;
        if self.ledger.reconcile_interval_secs == 0 {
            return Err(risk::Error::InvalidParameters(
                "ledger.reconcile_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
