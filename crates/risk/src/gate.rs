// In crates/risk/src/gate.rs

use crate::history::RollingHistory;
use crate::metrics::{RiskMetrics, RiskMetricsBundle};
use crate::simulator::{Forecast, ScenarioSimulator};
use crate::types::{GatePolicy, SimulationSettings};
use crate::{Result, TradeValidator};
use chrono::{DateTime, Utc};
use core_types::{Direction, Instrument, TradeProposal};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// One of the four independent Monte Carlo gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateCheck {
    WinProbability,
    RiskOfRuin,
    ExpectedValue,
    ConfidenceLevel,
}

/// Why a validation did not produce a plain approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum RejectionReason {
    /// One or more gates failed. `detail` lists every failing gate.
    GatesFailed { failed: Vec<GateCheck>, detail: String },
    /// The gate is administratively disabled; the trade was waved through.
    Disabled,
    /// The pipeline could not produce trustworthy metrics; the trade is blocked.
    ValidationError { detail: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::GatesFailed { detail, .. } => f.write_str(detail),
            RejectionReason::Disabled => f.write_str("SSE_DISABLED"),
            RejectionReason::ValidationError { detail } => write!(f, "VALIDATION_ERROR: {}", detail),
        }
    }
}

/// The outcome of validating one proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub approved: bool,
    pub win_probability: f64,
    pub risk_of_ruin: f64,
    pub expected_value: f64,
    pub confidence_level: f64,
    pub scenarios_analyzed: usize,
    pub rejection_reason: Option<RejectionReason>,
    /// Set when a failing trade was approved because high-risk blocking is off.
    pub advisory_override: bool,
    pub metrics: Option<RiskMetricsBundle>,
}

impl ValidationResult {
    fn disabled() -> Self {
        Self {
            approved: true,
            win_probability: 0.0,
            risk_of_ruin: 0.0,
            expected_value: 0.0,
            confidence_level: 0.0,
            scenarios_analyzed: 0,
            rejection_reason: Some(RejectionReason::Disabled),
            advisory_override: false,
            metrics: None,
        }
    }

    fn failed_closed(detail: String) -> Self {
        Self {
            approved: false,
            win_probability: 0.0,
            risk_of_ruin: 1.0,
            expected_value: -1.0,
            confidence_level: 0.0,
            scenarios_analyzed: 0,
            rejection_reason: Some(RejectionReason::ValidationError { detail }),
            advisory_override: false,
            metrics: None,
        }
    }
}

/// A compact audit record of one validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord {
    pub timestamp: DateTime<Utc>,
    pub instrument: Instrument,
    pub direction: Direction,
    pub size: Decimal,
    pub approved: bool,
    pub win_probability: f64,
    pub risk_of_ruin: f64,
    pub expected_value: f64,
    pub confidence_level: f64,
    pub scenarios_analyzed: usize,
    pub rejection_reason: Option<String>,
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStatistics {
    pub total_validations: u64,
    pub approved_trades: u64,
    pub blocked_trades: u64,
    /// Approvals issued while the gate was disabled.
    pub bypassed_trades: u64,
    pub approval_rate: f64,
    pub block_rate: f64,
    pub enabled: bool,
    pub simulations_per_validation: usize,
}

/// Evaluates the four gates against `metrics` and returns every failure with
/// its human-readable reason, in gate order.
pub fn evaluate_gates(policy: &GatePolicy, metrics: &RiskMetricsBundle) -> Vec<(GateCheck, String)> {
    let mut failures = Vec::new();

    let win_probability = metrics.probability_of_profit;
    if win_probability < policy.min_win_probability {
        failures.push((
            GateCheck::WinProbability,
            format!(
                "Win probability {:.1}% < {:.1}%",
                win_probability * 100.0,
                policy.min_win_probability * 100.0
            ),
        ));
    }

    if metrics.risk_of_ruin > policy.max_risk_of_ruin {
        failures.push((
            GateCheck::RiskOfRuin,
            format!(
                "Risk of ruin {:.1}% > {:.1}%",
                metrics.risk_of_ruin * 100.0,
                policy.max_risk_of_ruin * 100.0
            ),
        ));
    }

    if metrics.expected_value < policy.min_expected_value {
        failures.push((
            GateCheck::ExpectedValue,
            format!(
                "Expected value {:.3} < {:.3}",
                metrics.expected_value, policy.min_expected_value
            ),
        ));
    }

    if metrics.confidence_level < policy.min_confidence - policy.confidence_tolerance {
        failures.push((
            GateCheck::ConfidenceLevel,
            format!(
                "Confidence level {:.1}% < {:.1}%",
                metrics.confidence_level * 100.0,
                policy.min_confidence * 100.0
            ),
        ));
    }

    failures
}

/// The pre-trade Monte Carlo firewall.
///
/// Every proposal is simulated, reduced to risk metrics and passed through four
/// gates; all four must pass for approval. Any failure to compute metrics
/// blocks the trade.
#[derive(Debug)]
pub struct PreTradeGate {
    policy: GatePolicy,
    settings: SimulationSettings,
    simulator: ScenarioSimulator,
    metrics: RiskMetrics,
    approved_count: u64,
    blocked_count: u64,
    bypassed_count: u64,
    history: RollingHistory<ValidationRecord>,
}

impl PreTradeGate {
    pub fn new(policy: GatePolicy, settings: SimulationSettings) -> Result<Self> {
        policy.validate()?;
        let simulator = ScenarioSimulator::from_settings(&settings)?;

        if policy.validates_trades() {
            tracing::info!(
                simulations = settings.n_simulations,
                seed = settings.seed,
                "Pre-trade gate initialized"
            );
        } else {
            tracing::warn!(
                enabled = policy.enabled,
                pre_trade_validation = policy.pre_trade_validation,
                "Pre-trade gate DISABLED: trades will be approved without Monte Carlo validation"
            );
        }

        Ok(Self {
            metrics: RiskMetrics::new(policy.ruin_threshold),
            history: RollingHistory::new(policy.history_capacity),
            policy,
            settings,
            simulator,
            approved_count: 0,
            blocked_count: 0,
            bypassed_count: 0,
        })
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Validates a proposal using a forecast derived from its market context.
    pub fn validate(&mut self, proposal: &TradeProposal) -> ValidationResult {
        let forecast = Forecast::from_proposal(proposal, &self.settings);
        self.validate_with_forecast(proposal, &forecast)
    }

    /// Validates a proposal against explicit forecast inputs.
    pub fn validate_with_forecast(
        &mut self,
        proposal: &TradeProposal,
        forecast: &Forecast,
    ) -> ValidationResult {
        if !self.policy.validates_trades() {
            tracing::warn!(
                instrument = %proposal.instrument(),
                "Pre-trade validation BYPASSED: trade approved without Monte Carlo analysis"
            );
            let result = ValidationResult::disabled();
            self.bypassed_count += 1;
            self.approved_count += 1;
            self.record(proposal, &result);
            return result;
        }

        tracing::info!(
            instrument = %proposal.instrument(),
            direction = %proposal.direction(),
            size = %proposal.size(),
            simulations = self.settings.n_simulations,
            "Pre-trade validation starting"
        );

        let result = match self.simulate_and_reduce(forecast) {
            Ok(metrics) => self.decide(&metrics),
            Err(e) => {
                tracing::error!(error = %e, "Pre-trade validation failed; blocking trade");
                ValidationResult::failed_closed(e.to_string())
            }
        };

        if result.approved {
            self.approved_count += 1;
            tracing::info!(
                win_probability = result.win_probability,
                advisory_override = result.advisory_override,
                "Trade APPROVED by pre-trade gate"
            );
        } else {
            self.blocked_count += 1;
            if let Some(reason) = &result.rejection_reason {
                tracing::warn!(%reason, "Trade BLOCKED by pre-trade gate");
            }
        }

        self.record(proposal, &result);
        result
    }

    fn simulate_and_reduce(&mut self, forecast: &Forecast) -> Result<RiskMetricsBundle> {
        let scenarios = self
            .simulator
            .simulate_forecast(forecast, self.settings.n_simulations);
        self.metrics.reduce(&scenarios)
    }

    /// Applies the gate policy to precomputed metrics. Does not touch counters
    /// or history.
    pub fn decide(&self, metrics: &RiskMetricsBundle) -> ValidationResult {
        let failures = evaluate_gates(&self.policy, metrics);

        let rejection_reason = if failures.is_empty() {
            None
        } else {
            let detail = failures
                .iter()
                .map(|(_, reason)| reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            Some(RejectionReason::GatesFailed {
                failed: failures.iter().map(|(check, _)| *check).collect(),
                detail,
            })
        };

        let passed = rejection_reason.is_none();
        let approved = passed || !self.policy.block_high_risk_trades;

        ValidationResult {
            approved,
            win_probability: metrics.probability_of_profit,
            risk_of_ruin: metrics.risk_of_ruin,
            expected_value: metrics.expected_value,
            confidence_level: metrics.confidence_level,
            scenarios_analyzed: metrics.scenarios_count,
            advisory_override: !passed && approved,
            rejection_reason,
            metrics: Some(metrics.clone()),
        }
    }

    fn record(&mut self, proposal: &TradeProposal, result: &ValidationResult) {
        self.history.push(ValidationRecord {
            timestamp: Utc::now(),
            instrument: proposal.instrument().clone(),
            direction: proposal.direction(),
            size: proposal.size(),
            approved: result.approved,
            win_probability: result.win_probability,
            risk_of_ruin: result.risk_of_ruin,
            expected_value: result.expected_value,
            confidence_level: result.confidence_level,
            scenarios_analyzed: result.scenarios_analyzed,
            rejection_reason: result.rejection_reason.as_ref().map(|r| r.to_string()),
        });
    }

    pub fn history(&self) -> &RollingHistory<ValidationRecord> {
        &self.history
    }

    pub fn statistics(&self) -> GateStatistics {
        let total = self.approved_count + self.blocked_count;
        let rate = |count: u64| if total > 0 { count as f64 / total as f64 } else { 0.0 };
        GateStatistics {
            total_validations: total,
            approved_trades: self.approved_count,
            blocked_trades: self.blocked_count,
            bypassed_trades: self.bypassed_count,
            approval_rate: rate(self.approved_count),
            block_rate: rate(self.blocked_count),
            enabled: self.policy.enabled,
            simulations_per_validation: self.settings.n_simulations,
        }
    }
}

impl TradeValidator for PreTradeGate {
    fn name(&self) -> &'static str {
        "PreTradeGate"
    }

    fn validate(&mut self, proposal: &TradeProposal) -> ValidationResult {
        PreTradeGate::validate(self, proposal)
    }

    fn statistics(&self) -> GateStatistics {
        PreTradeGate::statistics(self)
    }
}
