// In crates/risk/src/simulator.rs

use crate::types::{ShockKind, ShockProbabilities, ShockTable, SimulationSettings};
use crate::Result;
use core_types::{InstrumentClass, TradeProposal};
use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

/// An ordered, fixed-length sequence of simulated trade outcomes.
///
/// Positive values are profitable outcomes, negative values are losses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScenarioSet {
    outcomes: Vec<f64>,
}

impl ScenarioSet {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.outcomes
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.outcomes.iter()
    }
}

impl From<Vec<f64>> for ScenarioSet {
    fn from(outcomes: Vec<f64>) -> Self {
        Self { outcomes }
    }
}

/// The inputs the scenario engine needs for one proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub base_prediction: f64,
    pub volatility: f64,
    pub shocks: ShockProbabilities,
}

impl Forecast {
    /// Derives the simulation inputs from a proposal and its optional market
    /// context.
    ///
    /// * The base prediction defaults to the proposal's confidence score.
    /// * Volatility defaults to the instrument-class value, is damped by
    ///   confidence and clamped to the configured bounds.
    /// * Shock probabilities start from the configured table and are weighted
    ///   by instrument class.
    pub fn from_proposal(proposal: &TradeProposal, settings: &SimulationSettings) -> Self {
        let context = proposal.market_context();
        let class = proposal.instrument_class();
        let vol = &settings.volatility;

        let base_prediction = context
            .and_then(|ctx| ctx.base_prediction)
            .unwrap_or_else(|| proposal.confidence());

        let raw_volatility = context
            .and_then(|ctx| ctx.volatility)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(match class {
                InstrumentClass::Forex => vol.forex,
                InstrumentClass::Index => vol.index,
                InstrumentClass::Commodity => vol.commodity,
            });
        let damping = 1.0 - proposal.confidence() * vol.confidence_damping;
        let volatility = (raw_volatility * damping).clamp(vol.floor, vol.ceiling);

        let mut shocks = settings.shocks.base_probabilities();
        match class {
            InstrumentClass::Index => {
                scale_shock(&mut shocks, ShockKind::MarketCrash, settings.index_crash_multiplier)
            }
            InstrumentClass::Forex => scale_shock(
                &mut shocks,
                ShockKind::Geopolitical,
                settings.forex_geopolitical_multiplier,
            ),
            InstrumentClass::Commodity => {}
        }

        Self {
            base_prediction,
            volatility,
            shocks,
        }
    }
}

fn scale_shock(shocks: &mut ShockProbabilities, kind: ShockKind, multiplier: f64) {
    if let Some(p) = shocks.get_mut(&kind) {
        *p = (*p * multiplier).clamp(0.0, 1.0);
    }
}

/// Monte Carlo scenario generator.
///
/// Each instance owns its own seeded random stream; two simulators built with
/// the same seed and fed the same inputs produce identical scenario sets.
/// Instances must not be shared between concurrent validations.
#[derive(Debug, Clone)]
pub struct ScenarioSimulator {
    shocks: ShockTable,
    seed: u64,
    rng: ChaCha8Rng,
}

impl ScenarioSimulator {
    pub fn new(seed: u64, shocks: ShockTable) -> Self {
        Self {
            shocks,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn from_settings(settings: &SimulationSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::new(settings.seed, settings.shocks.clone()))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restarts the random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.seed = seed;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Generates `n` independent scenarios around `base_prediction`.
    ///
    /// Every scenario gets Gaussian noise with standard deviation
    /// `volatility`, then each shock kind fires independently with its
    /// probability and adds a magnitude drawn from the kind's profile.
    /// `n == 0` returns an empty set.
    pub fn simulate(
        &mut self,
        base_prediction: f64,
        volatility: f64,
        shocks: &ShockProbabilities,
        n: usize,
    ) -> ScenarioSet {
        let volatility = volatility.max(0.0);
        tracing::debug!(
            n,
            base_prediction,
            volatility,
            shock_kinds = shocks.len(),
            "Simulating scenarios"
        );

        let mut outcomes = Vec::with_capacity(n);
        for _ in 0..n {
            let mut outcome = base_prediction + sample_normal(&mut self.rng, 0.0, volatility);

            for (kind, probability) in shocks {
                let probability = probability.clamp(0.0, 1.0);
                if self.rng.r#gen::<f64>() < probability {
                    let profile = self.shocks.profile(*kind);
                    outcome += sample_normal(&mut self.rng, profile.mean, profile.std_dev);
                }
            }

            outcomes.push(outcome);
        }

        ScenarioSet::from(outcomes)
    }

    /// Convenience wrapper for a derived [`Forecast`].
    pub fn simulate_forecast(&mut self, forecast: &Forecast, n: usize) -> ScenarioSet {
        self.simulate(forecast.base_prediction, forecast.volatility, &forecast.shocks, n)
    }
}

/// Draws one normal sample. A zero spread is deterministic.
fn sample_normal<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return mean;
    }
    match Normal::new(mean, std_dev) {
        Ok(normal) => normal.sample(rng),
        // NaN poisons the scenario set so the metrics step fails closed.
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{Direction, Instrument, MarketContext};
    use rust_decimal_macros::dec;

    fn no_shocks() -> ShockProbabilities {
        ShockProbabilities::new()
    }

    #[test]
    fn same_seed_reproduces_the_same_scenarios() {
        let shocks = ShockTable::default().base_probabilities();
        let mut a = ScenarioSimulator::new(7, ShockTable::default());
        let mut b = ScenarioSimulator::new(7, ShockTable::default());

        assert_eq!(
            a.simulate(0.05, 0.02, &shocks, 500),
            b.simulate(0.05, 0.02, &shocks, 500)
        );
    }

    #[test]
    fn reseed_restarts_the_stream() {
        let mut sim = ScenarioSimulator::new(11, ShockTable::default());
        let first = sim.simulate(0.0, 0.01, &no_shocks(), 100);
        sim.reseed(11);
        assert_eq!(first, sim.simulate(0.0, 0.01, &no_shocks(), 100));
    }

    #[test]
    fn zero_scenarios_yields_empty_set() {
        let mut sim = ScenarioSimulator::new(1, ShockTable::default());
        assert!(sim.simulate(0.1, 0.02, &no_shocks(), 0).is_empty());
    }

    #[test]
    fn zero_volatility_without_shocks_is_constant() {
        let mut sim = ScenarioSimulator::new(1, ShockTable::default());
        let set = sim.simulate(0.01, 0.0, &no_shocks(), 50);
        assert!(set.iter().all(|s| *s == 0.01));
    }

    #[test]
    fn normal_draw_handles_degenerate_spreads() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert_eq!(sample_normal(&mut rng, 0.3, 0.0), 0.3);
        assert_eq!(sample_normal(&mut rng, 0.3, -1.0), 0.3);
        assert!(sample_normal(&mut rng, 0.3, f64::NAN).is_nan());
        assert!(sample_normal(&mut rng, 0.3, 0.1).is_finite());
    }

    #[test]
    fn certain_crash_shifts_every_scenario_down() {
        let mut sim = ScenarioSimulator::new(3, ShockTable::default());
        let mut shocks = no_shocks();
        shocks.insert(ShockKind::MarketCrash, 1.0);

        let set = sim.simulate(0.0, 0.0, &shocks, 2_000);
        let mean = set.iter().sum::<f64>() / set.len() as f64;
        assert!((mean + 0.2).abs() < 0.01, "mean {} should be close to -0.2", mean);
    }

    #[test]
    fn sample_mean_and_dispersion_track_inputs() {
        let mut sim = ScenarioSimulator::new(42, ShockTable::default());
        let set = sim.simulate(0.002, 0.02, &no_shocks(), 10_000);
        let n = set.len() as f64;
        let mean = set.iter().sum::<f64>() / n;
        let std = (set.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!((mean - 0.002).abs() < 0.001);
        assert!((std - 0.02).abs() < 0.001);
    }

    #[test]
    fn forecast_uses_class_defaults_and_weights() {
        let settings = SimulationSettings::default();
        let proposal = TradeProposal::new(
            Instrument("IX.D.FTSE.DAILY.IP".to_string()),
            Direction::Long,
            dec!(1),
            dec!(7500),
            0.5,
        )
        .unwrap();

        let forecast = Forecast::from_proposal(&proposal, &settings);
        assert_eq!(forecast.base_prediction, 0.5);
        // 0.025 * (1 - 0.5 * 0.2)
        assert!((forecast.volatility - 0.0225).abs() < 1e-12);
        assert!((forecast.shocks[&ShockKind::MarketCrash] - 0.015).abs() < 1e-12);
        assert_eq!(forecast.shocks[&ShockKind::Geopolitical], 0.015);
    }

    #[test]
    fn forecast_prefers_context_and_clamps_volatility() {
        let settings = SimulationSettings::default();
        let proposal = TradeProposal::new(
            Instrument("CS.D.EURUSD.TODAY.IP".to_string()),
            Direction::Short,
            dec!(2),
            dec!(1.08),
            0.0,
        )
        .unwrap()
        .with_market_context(MarketContext {
            base_prediction: Some(0.3),
            volatility: Some(0.9),
            instrument_class: None,
        });

        let forecast = Forecast::from_proposal(&proposal, &settings);
        assert_eq!(forecast.base_prediction, 0.3);
        assert_eq!(forecast.volatility, 0.10);
        assert!((forecast.shocks[&ShockKind::Geopolitical] - 0.0195).abs() < 1e-12);
    }
}
