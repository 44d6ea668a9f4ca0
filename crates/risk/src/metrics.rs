// In crates/risk/src/metrics.rs

use crate::simulator::ScenarioSet;
use crate::{Error, Result};
use serde::Serialize;
use statrs::statistics::Statistics;

/// Lower bound for any reported probability. The engine never claims an
/// outcome is impossible or certain.
pub const PROBABILITY_FLOOR: f64 = 0.001;
/// Upper bound for any reported probability.
pub const PROBABILITY_CEILING: f64 = 0.999;

/// Means closer to zero than this are treated as a coin flip.
const NEAR_ZERO_MEAN: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Percentiles {
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
}

/// The statistics derived from one scenario set.
///
/// `probability_of_loss + probability_of_profit` is exactly `1.0` and both
/// lie in `[0.001, 0.999]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetricsBundle {
    /// 95% value at risk (5th percentile outcome).
    pub var_95: f64,
    /// 99% value at risk (1st percentile outcome).
    pub var_99: f64,
    /// Mean of the outcomes at or below `var_95`.
    pub cvar_95: f64,
    pub expected_value: f64,
    pub std_dev: f64,
    pub probability_of_loss: f64,
    pub probability_of_profit: f64,
    /// Mass below the configured ruin threshold.
    pub risk_of_ruin: f64,
    /// How tightly the outcomes cluster around the mean, in `[0, 1]`.
    pub confidence_level: f64,
    pub skewness: f64,
    /// Excess kurtosis (0 for a normal distribution).
    pub kurtosis: f64,
    /// Worst outcome relative to the mean.
    pub max_drawdown: f64,
    /// 95th percentile relative to the mean.
    pub upside_potential: f64,
    pub percentiles: Percentiles,
    pub scenarios_count: usize,
}

/// Reduces scenario sets to a [`RiskMetricsBundle`].
#[derive(Debug, Clone)]
pub struct RiskMetrics {
    ruin_threshold: f64,
}

impl RiskMetrics {
    /// `ruin_threshold` is a positive fraction of notional; outcomes below
    /// `-ruin_threshold` count as ruin.
    pub fn new(ruin_threshold: f64) -> Self {
        Self { ruin_threshold }
    }

    pub fn reduce(&self, scenarios: &ScenarioSet) -> Result<RiskMetricsBundle> {
        if scenarios.is_empty() {
            return Err(Error::EmptyScenarioSet);
        }
        if scenarios.iter().any(|s| !s.is_finite()) {
            return Err(Error::NonFiniteStatistic { metric: "scenarios" });
        }

        let n = scenarios.len() as f64;
        let mut sorted = scenarios.as_slice().to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        // --- Probabilities ---
        let losses = scenarios.iter().filter(|s| **s < 0.0).count() as f64;
        let raw_loss = losses / n;
        let probability_of_loss = raw_loss.clamp(PROBABILITY_FLOOR, PROBABILITY_CEILING);
        // The win probability is always derived from the loss probability and
        // never measured on its own, so the two always sum to one.
        let probability_of_profit = 1.0 - probability_of_loss;

        let measured_wins = scenarios.iter().filter(|s| **s > 0.0).count() as f64 / n;
        if measured_wins >= PROBABILITY_CEILING && raw_loss > 0.0 {
            tracing::warn!(
                measured_wins,
                probability_of_loss,
                "Measured win rate contradicts a non-zero loss probability; using 1 - P(loss)"
            );
        }

        let ruin = scenarios.iter().filter(|s| **s < -self.ruin_threshold).count() as f64;
        let risk_of_ruin = ruin / n;

        // --- Moments ---
        let expected_value = scenarios.as_slice().iter().mean();
        let std_dev = scenarios.as_slice().iter().population_std_dev();
        let (skewness, kurtosis) = standardized_moments(scenarios.as_slice(), expected_value, std_dev);

        let confidence_level = if expected_value.abs() < NEAR_ZERO_MEAN {
            0.0
        } else {
            (1.0 - std_dev / (expected_value.abs() + NEAR_ZERO_MEAN)).clamp(0.0, 1.0)
        };

        // --- Tail statistics ---
        let var_95 = percentile(&sorted, 5.0);
        let var_99 = percentile(&sorted, 1.0);
        let tail: Vec<f64> = sorted.iter().copied().take_while(|s| *s <= var_95).collect();
        let cvar_95 = if tail.is_empty() { var_95 } else { tail.iter().mean() };

        let percentiles = Percentiles {
            p5: var_95,
            p25: percentile(&sorted, 25.0),
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
            p95: percentile(&sorted, 95.0),
        };

        let bundle = RiskMetricsBundle {
            var_95,
            var_99,
            cvar_95,
            expected_value,
            std_dev,
            probability_of_loss,
            probability_of_profit,
            risk_of_ruin,
            confidence_level,
            skewness,
            kurtosis,
            max_drawdown: sorted[0] - expected_value,
            upside_potential: percentiles.p95 - expected_value,
            percentiles,
            scenarios_count: scenarios.len(),
        };
        bundle.ensure_finite()?;

        tracing::debug!(
            probability_of_loss = bundle.probability_of_loss,
            risk_of_ruin = bundle.risk_of_ruin,
            expected_value = bundle.expected_value,
            confidence_level = bundle.confidence_level,
            var_95 = bundle.var_95,
            "Scenario set reduced"
        );

        Ok(bundle)
    }
}

impl RiskMetricsBundle {
    fn ensure_finite(&self) -> Result<()> {
        let fields = [
            ("var_95", self.var_95),
            ("var_99", self.var_99),
            ("cvar_95", self.cvar_95),
            ("expected_value", self.expected_value),
            ("std_dev", self.std_dev),
            ("confidence_level", self.confidence_level),
            ("skewness", self.skewness),
            ("kurtosis", self.kurtosis),
        ];
        for (metric, value) in fields {
            if !value.is_finite() {
                return Err(Error::NonFiniteStatistic { metric });
            }
        }
        Ok(())
    }
}

/// Linear-interpolated percentile of an ascending slice. `p` is in `[0, 100]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Skewness and excess kurtosis; both zero for a degenerate distribution.
fn standardized_moments(data: &[f64], mean: f64, std_dev: f64) -> (f64, f64) {
    if std_dev == 0.0 {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let (m3, m4) = data.iter().fold((0.0, 0.0), |(m3, m4), x| {
        let z = (x - mean) / std_dev;
        (m3 + z.powi(3), m4 + z.powi(4))
    });
    (m3 / n, m4 / n - 3.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::ScenarioSimulator;
    use crate::types::{ShockProbabilities, ShockTable};
    use statrs::distribution::{ContinuousCDF, Normal};

    fn reduce(values: Vec<f64>) -> RiskMetricsBundle {
        RiskMetrics::new(0.2).reduce(&ScenarioSet::from(values)).unwrap()
    }

    #[test]
    fn probabilities_sum_to_exactly_one() {
        let mut sim = ScenarioSimulator::new(5, ShockTable::default());
        for base in [-0.5, -0.01, 0.0, 0.003, 0.1, 0.8] {
            let set = sim.simulate(base, 0.03, &ShockTable::default().base_probabilities(), 2_000);
            let m = RiskMetrics::new(0.2).reduce(&set).unwrap();
            assert_eq!(m.probability_of_loss + m.probability_of_profit, 1.0);
            assert!((PROBABILITY_FLOOR..=PROBABILITY_CEILING).contains(&m.probability_of_loss));
            assert!((PROBABILITY_FLOOR..=PROBABILITY_CEILING).contains(&m.probability_of_profit));
        }
    }

    #[test]
    fn all_positive_outcomes_cap_loss_at_floor() {
        let m = reduce(vec![0.01; 1_000]);
        assert_eq!(m.probability_of_loss, 0.001);
        assert_eq!(m.probability_of_profit, 0.999);
    }

    #[test]
    fn all_negative_outcomes_cap_loss_at_ceiling() {
        let m = reduce(vec![-0.5; 1_000]);
        assert_eq!(m.probability_of_loss, 0.999);
        assert_eq!(m.probability_of_loss + m.probability_of_profit, 1.0);
        assert_eq!(m.risk_of_ruin, 1.0);
    }

    #[test]
    fn all_zero_outcomes_stay_within_bounds() {
        let m = reduce(vec![0.0; 1_000]);
        assert_eq!(m.probability_of_loss, 0.001);
        assert_eq!(m.confidence_level, 0.0);
        assert_eq!(m.skewness, 0.0);
        assert_eq!(m.kurtosis, 0.0);
    }

    #[test]
    fn loss_probability_matches_normal_cdf() {
        let mut sim = ScenarioSimulator::new(42, ShockTable::default());
        let set = sim.simulate(0.002, 0.02, &ShockProbabilities::new(), 10_000);
        let m = RiskMetrics::new(0.2).reduce(&set).unwrap();

        let expected = Normal::new(0.0, 1.0).unwrap().cdf(-0.002 / 0.02);
        assert!(
            (m.probability_of_loss - expected).abs() < 0.05,
            "P(loss) {} too far from {}",
            m.probability_of_loss,
            expected
        );
    }

    #[test]
    fn tail_metrics_are_ordered() {
        let values: Vec<f64> = (0..1_000).map(|i| i as f64 / 1_000.0 - 0.5).collect();
        let m = reduce(values);
        assert!(m.var_99 < m.var_95);
        assert!(m.cvar_95 <= m.var_95);
        assert!(m.percentiles.p5 < m.percentiles.p50);
        assert!(m.percentiles.p50 < m.percentiles.p95);
        assert!((m.percentiles.p50 - (-0.0005)).abs() < 1e-9);
    }

    #[test]
    fn confidence_level_reflects_dispersion() {
        let tight = reduce(vec![0.99, 1.0, 1.01, 1.0]);
        let loose = reduce(vec![0.2, 1.8, -0.4, 2.4]);
        assert!(tight.confidence_level > 0.98);
        assert_eq!(loose.confidence_level, 0.0);
    }

    #[test]
    fn empty_set_is_an_error() {
        let result = RiskMetrics::new(0.2).reduce(&ScenarioSet::default());
        assert_eq!(result, Err(Error::EmptyScenarioSet));
    }

    #[test]
    fn non_finite_scenarios_are_an_error() {
        let result = RiskMetrics::new(0.2).reduce(&ScenarioSet::from(vec![0.1, f64::NAN]));
        assert!(matches!(result, Err(Error::NonFiniteStatistic { .. })));
    }
}
