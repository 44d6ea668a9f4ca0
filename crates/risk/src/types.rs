// In crates/risk/src/types.rs

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named class of tail-risk event that can hit a scenario on top of the
/// ordinary Gaussian noise.
///
/// The `Ord` derive fixes the order in which shocks are drawn, which keeps
/// seeded simulations reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShockKind {
    MarketCrash,
    Geopolitical,
    LiquidityCrisis,
    PositiveSurprise,
}

impl ShockKind {
    pub const ALL: [ShockKind; 4] = [
        ShockKind::MarketCrash,
        ShockKind::Geopolitical,
        ShockKind::LiquidityCrisis,
        ShockKind::PositiveSurprise,
    ];
}

impl fmt::Display for ShockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShockKind::MarketCrash => "market_crash",
            ShockKind::Geopolitical => "geopolitical",
            ShockKind::LiquidityCrisis => "liquidity_crisis",
            ShockKind::PositiveSurprise => "positive_surprise",
        };
        f.write_str(name)
    }
}

/// Shock probabilities keyed by kind, in draw order.
pub type ShockProbabilities = BTreeMap<ShockKind, f64>;

/// Magnitude distribution and base hit probability for one shock kind.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShockProfile {
    /// Mean of the normally distributed shock magnitude.
    pub mean: f64,
    /// Standard deviation of the shock magnitude.
    pub std_dev: f64,
    /// Per-scenario probability that the shock fires, before instrument
    /// adjustments.
    pub probability: f64,
}

/// The full shock-kind table. Every recognised kind has its own entry.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ShockTable {
    pub market_crash: ShockProfile,
    pub geopolitical: ShockProfile,
    pub liquidity_crisis: ShockProfile,
    pub positive_surprise: ShockProfile,
}

impl Default for ShockTable {
    fn default() -> Self {
        Self {
            market_crash: ShockProfile { mean: -0.20, std_dev: 0.05, probability: 0.010 },
            geopolitical: ShockProfile { mean: -0.10, std_dev: 0.03, probability: 0.015 },
            liquidity_crisis: ShockProfile { mean: -0.15, std_dev: 0.04, probability: 0.005 },
            positive_surprise: ShockProfile { mean: 0.10, std_dev: 0.02, probability: 0.020 },
        }
    }
}

impl ShockTable {
    pub fn profile(&self, kind: ShockKind) -> &ShockProfile {
        match kind {
            ShockKind::MarketCrash => &self.market_crash,
            ShockKind::Geopolitical => &self.geopolitical,
            ShockKind::LiquidityCrisis => &self.liquidity_crisis,
            ShockKind::PositiveSurprise => &self.positive_surprise,
        }
    }

    pub fn base_probabilities(&self) -> ShockProbabilities {
        ShockKind::ALL
            .iter()
            .map(|kind| (*kind, self.profile(*kind).probability))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        for kind in ShockKind::ALL {
            let profile = self.profile(kind);
            if !profile.mean.is_finite() || !profile.std_dev.is_finite() || profile.std_dev < 0.0 {
                return Err(Error::InvalidParameters(format!(
                    "shock '{}' needs a finite mean and a non-negative std_dev",
                    kind
                )));
            }
            if !(0.0..=1.0).contains(&profile.probability) {
                return Err(Error::InvalidParameters(format!(
                    "shock '{}' probability {} is outside [0, 1]",
                    kind, profile.probability
                )));
            }
        }
        Ok(())
    }
}

/// Default volatility per instrument class and the bounds applied after the
/// confidence adjustment.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct VolatilitySettings {
    pub forex: f64,
    pub index: f64,
    pub commodity: f64,
    /// Volatility is scaled by `1 - confidence * confidence_damping`.
    pub confidence_damping: f64,
    pub floor: f64,
    pub ceiling: f64,
}

impl Default for VolatilitySettings {
    fn default() -> Self {
        Self {
            forex: 0.015,
            index: 0.025,
            commodity: 0.03,
            confidence_damping: 0.2,
            floor: 0.005,
            ceiling: 0.10,
        }
    }
}

/// Configuration for the Monte Carlo scenario engine.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationSettings {
    /// Scenarios generated per validation.
    pub n_simulations: usize,
    /// Seed for the deterministic random stream.
    pub seed: u64,
    pub shocks: ShockTable,
    pub volatility: VolatilitySettings,
    /// Index instruments are more exposed to crashes.
    pub index_crash_multiplier: f64,
    /// Currency instruments are more exposed to geopolitical events.
    pub forex_geopolitical_multiplier: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            n_simulations: 10_000,
            seed: 42,
            shocks: ShockTable::default(),
            volatility: VolatilitySettings::default(),
            index_crash_multiplier: 1.5,
            forex_geopolitical_multiplier: 1.3,
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.n_simulations == 0 {
            return Err(Error::InvalidParameters(
                "n_simulations must be at least 1".to_string(),
            ));
        }
        self.shocks.validate()?;
        let vol = &self.volatility;
        let finite_bounds = vol.floor.is_finite() && vol.ceiling.is_finite();
        if !finite_bounds || vol.floor < 0.0 || vol.floor > vol.ceiling {
            return Err(Error::InvalidParameters(format!(
                "volatility bounds [{}, {}] are not a valid range",
                vol.floor, vol.ceiling
            )));
        }
        let class_volatilities = [vol.forex, vol.index, vol.commodity];
        if class_volatilities.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::InvalidParameters(
                "instrument-class volatilities must be finite and non-negative".to_string(),
            ));
        }
        if !vol.confidence_damping.is_finite() {
            return Err(Error::InvalidParameters(format!(
                "confidence_damping must be finite, got {}",
                vol.confidence_damping
            )));
        }
        let multipliers = [self.index_crash_multiplier, self.forex_geopolitical_multiplier];
        if multipliers.iter().any(|m| !m.is_finite() || *m < 0.0) {
            return Err(Error::InvalidParameters(
                "shock multipliers must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thresholds for the pre-trade Monte Carlo gates.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct GatePolicy {
    /// When false every trade is approved with an explicit `SSE_DISABLED` marker.
    pub enabled: bool,
    /// Switches off only the per-trade Monte Carlo check while the gate stays
    /// enabled. Bypassed trades carry the same `SSE_DISABLED` marker.
    pub pre_trade_validation: bool,
    /// When false, failing trades are approved in advisory mode with their
    /// rejection reason kept on the result.
    pub block_high_risk_trades: bool,
    pub min_win_probability: f64,
    pub max_risk_of_ruin: f64,
    /// Outcomes below `-ruin_threshold` count towards the risk of ruin.
    pub ruin_threshold: f64,
    pub min_expected_value: f64,
    pub min_confidence: f64,
    /// Slack subtracted from `min_confidence` before comparing.
    pub confidence_tolerance: f64,
    /// Validation results kept for statistics.
    pub history_capacity: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_trade_validation: true,
            block_high_risk_trades: true,
            min_win_probability: 0.65,
            max_risk_of_ruin: 0.05,
            ruin_threshold: 0.20,
            min_expected_value: 0.10,
            min_confidence: 0.99,
            confidence_tolerance: 0.01,
            history_capacity: 1_000,
        }
    }
}

impl GatePolicy {
    /// True when proposals go through the Monte Carlo gates rather than
    /// being approved unchecked.
    pub fn validates_trades(&self) -> bool {
        self.enabled && self.pre_trade_validation
    }

    pub fn validate(&self) -> Result<()> {
        let unit_interval = [
            ("min_win_probability", self.min_win_probability),
            ("max_risk_of_ruin", self.max_risk_of_ruin),
            ("min_confidence", self.min_confidence),
            ("confidence_tolerance", self.confidence_tolerance),
        ];
        for (name, value) in unit_interval {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidParameters(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.ruin_threshold.is_nan() || self.ruin_threshold <= 0.0 {
            return Err(Error::InvalidParameters(format!(
                "ruin_threshold must be positive, got {}",
                self.ruin_threshold
            )));
        }
        if !self.min_expected_value.is_finite() {
            return Err(Error::InvalidParameters(
                "min_expected_value must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Position sizing constraints for the margin sizer.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct MarginSettings {
    /// Margin buffer multiplier, e.g. 1.2 keeps 20% headroom.
    pub safety_factor: f64,
    /// Smallest position the broker accepts.
    pub min_units: f64,
    pub max_units: Option<f64>,
    /// Size granularity the broker accepts.
    pub size_increment: f64,
    /// Utilisation above this percentage is logged as a warning.
    pub high_utilization_pct: f64,
}

impl Default for MarginSettings {
    fn default() -> Self {
        Self {
            safety_factor: 1.2,
            min_units: 0.1,
            max_units: None,
            size_increment: 0.1,
            high_utilization_pct: 80.0,
        }
    }
}
