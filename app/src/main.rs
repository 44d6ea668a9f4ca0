// In app/src/main.rs

use anyhow::{Context, Result};
use app_config::Settings;
use clap::{Parser, Subcommand};
use core_types::{BrokerPosition, Direction, Instrument, MarketContext, TradeProposal};
use engine::broker::{BrokerGateway, PaperBroker};
use engine::{Engine, LedgerSnapshot, PositionLedger, TradeDecision, TradeRequest};
use num_traits::FromPrimitive;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use risk::{MarginSizer, PreTradeGate};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;

mod tracing_layer;
use crate::tracing_layer::{AlertCache, AlertLayer};

// --- Command-Line Interface Definition ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = "Pre-trade risk validation, margin sizing and position reconciliation.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a trade proposal through the Monte Carlo pre-trade gate.
    Validate {
        /// Broker instrument code (e.g., "CS.D.GBPUSD.TODAY.IP").
        #[arg(short, long)]
        instrument: String,

        /// LONG/BUY or SHORT/SELL.
        #[arg(short, long)]
        direction: String,

        #[arg(short, long)]
        size: Decimal,

        #[arg(long)]
        entry_price: Decimal,

        /// Forecast confidence in [0, 1].
        #[arg(short, long)]
        confidence: f64,

        /// Overrides the class-derived volatility.
        #[arg(long)]
        volatility: Option<f64>,

        /// Overrides the confidence-derived base prediction.
        #[arg(long)]
        base_prediction: Option<f64>,
    },

    /// Computes a margin-safe position size.
    Size {
        #[arg(long)]
        available: Decimal,

        #[arg(long)]
        margin_per_unit: Decimal,

        #[arg(long)]
        min_units: Option<Decimal>,

        #[arg(long)]
        max_units: Option<Decimal>,

        /// Risk budget in account currency; sizes by stop distance as well when set.
        #[arg(long, requires_all = ["stop_distance", "point_value"])]
        risk_amount: Option<Decimal>,

        #[arg(long)]
        stop_distance: Option<Decimal>,

        #[arg(long)]
        point_value: Option<Decimal>,
    },

    /// Reconciles a ledger snapshot against a broker positions file.
    Reconcile {
        /// JSON array of broker positions.
        #[arg(short, long)]
        positions: PathBuf,

        /// Ledger snapshot to start from; rewritten with the reconciled state.
        #[arg(short, long)]
        ledger: Option<PathBuf>,
    },

    /// Runs a paper-trading loop against the in-memory broker.
    Run {
        /// Number of trade proposals to generate.
        #[arg(long, default_value_t = 20)]
        trades: usize,

        /// Seed for the proposal generator.
        #[arg(long, default_value_t = 7)]
        seed: u64,

        /// Pause between proposals, in milliseconds.
        #[arg(long, default_value_t = 50)]
        pace_ms: u64,
    },
}

// --- Main Application Entry Point ---

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from a .env file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let cli = Cli::parse();

    let settings = app_config::load_settings().context("Failed to load settings")?;

    // --- Tracing Setup ---
    let alerts: AlertCache = Arc::new(Mutex::new(VecDeque::new()));
    let level = tracing::Level::from_str(&settings.app.log_level).unwrap_or(tracing::Level::INFO);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::Targets::new().with_default(level));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(AlertLayer::new(alerts.clone()))
        .init();

    tracing::info!(environment = %settings.app.environment, "Starting riskcore");

    // Match on the parsed command and call the appropriate handler.
    match cli.command {
        Commands::Validate {
            instrument,
            direction,
            size,
            entry_price,
            confidence,
            volatility,
            base_prediction,
        } => {
            let context = MarketContext {
                base_prediction,
                volatility,
                instrument_class: None,
            };
            let proposal = TradeProposal::new(
                Instrument(instrument),
                parse_direction(&direction)?,
                size,
                entry_price,
                confidence,
            )?
            .with_market_context(context);
            handle_validate(&settings, &proposal)?;
        }
        Commands::Size {
            available,
            margin_per_unit,
            min_units,
            max_units,
            risk_amount,
            stop_distance,
            point_value,
        } => {
            let sizer = MarginSizer::new(&settings.margin)?;
            let calculation = match (risk_amount, stop_distance, point_value) {
                (Some(risk), Some(stop), Some(point)) => {
                    sizer.optimal_size(risk, stop, point, available, margin_per_unit)?
                }
                _ => sizer.size_with_bounds(
                    available,
                    margin_per_unit,
                    min_units.unwrap_or_else(|| sizer.min_units()),
                    max_units,
                ),
            };
            print_json(&calculation)?;
        }
        Commands::Reconcile { positions, ledger } => {
            handle_reconcile(&settings, &positions, ledger.as_deref())?;
        }
        Commands::Run {
            trades,
            seed,
            pace_ms,
        } => {
            run_paper(&settings, trades, seed, Duration::from_millis(pace_ms), alerts).await?;
        }
    }

    tracing::info!("riskcore has finished successfully.");

    Ok(())
}

fn parse_direction(raw: &str) -> Result<Direction> {
    serde_json::from_value(serde_json::Value::String(raw.to_uppercase()))
        .with_context(|| format!("Unknown direction '{}': expected LONG/BUY or SHORT/SELL", raw))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// --- "Validate" Subcommand Logic ---

fn handle_validate(settings: &Settings, proposal: &TradeProposal) -> Result<()> {
    let mut gate = PreTradeGate::new(settings.gate.clone(), settings.simulation.clone())?;
    let result = gate.validate(proposal);
    print_json(&result)?;
    if !result.approved {
        tracing::warn!("Proposal rejected");
    }
    Ok(())
}

// --- "Reconcile" Subcommand Logic ---

fn handle_reconcile(settings: &Settings, positions_path: &Path, ledger_path: Option<&Path>) -> Result<()> {
    let raw = std::fs::read_to_string(positions_path)
        .with_context(|| format!("Failed to read {}", positions_path.display()))?;
    let positions: Vec<BrokerPosition> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse broker positions in {}", positions_path.display()))?;

    let capacity = settings.ledger.history_capacity;
    let ledger = match ledger_path {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(path)?;
            let snapshot: LedgerSnapshot = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse ledger snapshot {}", path.display()))?;
            PositionLedger::from_snapshot(snapshot, capacity)?
        }
        _ => {
            tracing::info!("No ledger snapshot; starting cold from the broker's positions");
            PositionLedger::new(capacity)
        }
    };
    let mut ledger = ledger.with_terminal_retention(settings.ledger.terminal_retention);

    let result = ledger.reconcile(&positions);
    print_json(&result)?;

    if let Some(path) = ledger_path {
        std::fs::write(path, serde_json::to_string_pretty(&ledger.shutdown())?)
            .with_context(|| format!("Failed to write ledger snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), "Ledger snapshot written");
    }
    Ok(())
}

// --- "Run" Subcommand Logic ---

const PAPER_INSTRUMENTS: [(&str, Decimal, Decimal); 3] = [
    ("CS.D.GBPUSD.TODAY.IP", dec!(1.2650), dec!(3.33)),
    ("IX.D.FTSE.DAILY.IP", dec!(7500), dec!(37.5)),
    ("CC.D.LCO.UNC.IP", dec!(82.40), dec!(8.24)),
];

/// The paper-trading loop: generate a proposal, then size, validate, submit
/// and track it, with a reconciler running alongside.
async fn run_paper(
    settings: &Settings,
    trades: usize,
    seed: u64,
    pace: Duration,
    alerts: AlertCache,
) -> Result<()> {
    // --- 1. Initialization ---
    let broker = Arc::new(PaperBroker::new());
    let gateway: Arc<dyn BrokerGateway> = broker.clone();
    let mut engine = Engine::new(settings, gateway)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut available_margin = dec!(1000);

    // --- 2. Launch the reconciler ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = engine.reconciler();
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    // --- 3. The trading loop ---
    let mut open_deals = Vec::new();
    for i in 0..trades {
        let (code, price, margin_per_unit) = PAPER_INSTRUMENTS[rng.gen_range(0..PAPER_INSTRUMENTS.len())];
        let instrument = Instrument(code.to_string());

        // Random walk on the paper quote.
        let drift = Decimal::from_f64(rng.gen_range(-0.01..0.01)).unwrap_or_default();
        broker
            .set_price(instrument.clone(), (price * (Decimal::ONE + drift)).round_dp(4))
            .await;

        let direction = if rng.gen_bool(0.5) { Direction::Long } else { Direction::Short };
        let context = MarketContext {
            base_prediction: Some(rng.gen_range(-0.5..3.0)),
            volatility: None,
            instrument_class: None,
        };
        let proposal = TradeProposal::new(instrument, direction, dec!(10), price, rng.gen_range(0.5..1.0))?
            .with_market_context(context);
        let request = TradeRequest {
            proposal,
            available_margin,
            margin_per_unit,
        };

        match engine.execute_trade(&request).await? {
            TradeDecision::Submitted { deal_id, size, .. } => {
                available_margin -= size * margin_per_unit;
                open_deals.push((deal_id, size * margin_per_unit));
            }
            TradeDecision::Rejected { validation } => {
                tracing::info!(trade = i, win_probability = validation.win_probability, "Proposal rejected");
            }
            TradeDecision::MarginBlocked { calculation } => {
                tracing::info!(trade = i, reason = ?calculation.block_reason, "Proposal blocked by margin");
            }
            TradeDecision::BrokerRejected { reason, .. } => {
                tracing::warn!(trade = i, %reason, "Broker rejected order");
            }
        }

        // Occasionally close the oldest trade, or let the broker stop it out.
        if !open_deals.is_empty() && rng.gen_bool(0.3) {
            let (deal_id, margin) = open_deals.remove(0);
            if rng.gen_bool(0.5) {
                engine.close_trade(&deal_id).await?;
            } else {
                broker.drop_position(&deal_id).await;
            }
            available_margin += margin;
        }

        tokio::time::sleep(pace).await;
    }

    // --- 4. Shutdown ---
    engine.reconcile_once().await?;
    let _ = shutdown_tx.send(true);
    reconciler_handle.await??;

    let report = engine.shutdown().await;
    print_json(&report)?;

    if let Ok(alerts) = alerts.lock() {
        if !alerts.is_empty() {
            print_json(&*alerts)?;
        }
    }
    Ok(())
}
