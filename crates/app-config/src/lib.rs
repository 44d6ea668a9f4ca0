// In crates/app-config/src/lib.rs

use config::{Config, Environment, File, FileFormat};

pub mod error;
pub mod types;

// Re-export the most important types for easy access.
pub use error::{Error, Result};
pub use types::{AppSettings, LedgerSettings, Settings};

/// Loads the application settings from various sources.
///
/// This function orchestrates the layered configuration loading:
/// 1. Reads from a default `base.toml` file.
/// 2. Merges settings from an environment-specific file (e.g., `development.toml`).
/// 3. Merges settings from environment variables.
pub fn load_settings() -> Result<Settings> {
    // Get the current environment. Default to "development" if not set.
    let environment = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".into());

    let settings = Config::builder()
        // 1. Load the base configuration file.
        .add_source(File::with_name("config/base").required(false))
        // 2. Load the environment-specific configuration file.
        .add_source(File::with_name(&format!("config/{}", environment)).required(false))
        // 3. Load settings from environment variables (e.g., `APP__GATE__ENABLED=false`).
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    finish(settings)
}

/// Loads settings from a single TOML document, with defaults for anything it
/// leaves out.
pub fn load_settings_from_str(toml: &str) -> Result<Settings> {
    let settings = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?;

    finish(settings)
}

fn finish(config: Config) -> Result<Settings> {
    // Deserialize the configuration into our `Settings` struct.
    let settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = load_settings_from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.simulation.n_simulations, 10_000);
        assert_eq!(settings.simulation.seed, 42);
        assert_eq!(settings.gate.min_win_probability, 0.65);
        assert_eq!(settings.margin.safety_factor, 1.2);
        assert_eq!(settings.ledger.reconcile_interval_secs, 60);
    }

    #[test]
    fn sections_override_individual_keys() {
        let settings = load_settings_from_str(
            r#"
            [app]
            log_level = "debug"

            [simulation]
            n_simulations = 500
            seed = 7

            [simulation.shocks.market_crash]
            mean = -0.3
            std_dev = 0.05
            probability = 0.02

            [gate]
            block_high_risk_trades = false

            [margin]
            max_units = 25.0
            "#,
        )
        .unwrap();

        assert_eq!(settings.app.log_level, "debug");
        assert_eq!(settings.app.environment, "development");
        assert_eq!(settings.simulation.n_simulations, 500);
        assert_eq!(settings.simulation.shocks.market_crash.mean, -0.3);
        assert_eq!(settings.simulation.shocks.geopolitical.mean, -0.10);
        assert!(!settings.gate.block_high_risk_trades);
        assert!(settings.gate.enabled);
        assert!(settings.gate.pre_trade_validation);
        assert_eq!(settings.margin.max_units, Some(25.0));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = load_settings_from_str(
            r#"
            [gate]
            min_win_probabilty = 0.7
            "#,
        );
        assert!(matches!(result, Err(Error::LoadError(_))));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let result = load_settings_from_str(
            r#"
            [gate]
            max_risk_of_ruin = 1.5
            "#,
        );
        assert!(matches!(result, Err(Error::Invalid(_))));

        let result = load_settings_from_str(
            r#"
            [ledger]
            reconcile_interval_secs = 0
            "#,
        );
        assert!(matches!(result, Err(Error::Invalid(_))));

        let result = load_settings_from_str(
            r#"
            [simulation.volatility]
            floor = nan
            "#,
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }
}
