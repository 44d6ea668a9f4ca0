// In crates/core-types/src/types.rs

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A broker instrument code (e.g., "CS.D.GBPUSD.TODAY.IP").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument(pub String);

/// A broker-assigned identifier for an open position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DealId(pub String);

/// A client-generated identifier for a submitted order, used until the broker
/// assigns a `DealId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DealId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The direction of a trade or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(alias = "BUY", alias = "LONG", alias = "long")]
    Long,
    #[serde(alias = "SELL", alias = "SHORT", alias = "short")]
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Multiplies a price move into a P&L.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => f.write_str("LONG"),
            Direction::Short => f.write_str("SHORT"),
        }
    }
}

/// The broad asset class of an instrument. Drives default volatility and
/// tail-risk weighting in the scenario engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentClass {
    Forex,
    Index,
    Commodity,
}

impl InstrumentClass {
    /// Infers the class from the broker's instrument code prefix.
    /// Anything that is neither currency (`CS.D.`) nor index (`IX.D.`) is
    /// treated as a commodity.
    pub fn from_instrument(instrument: &Instrument) -> Self {
        if instrument.0.contains("CS.D.") {
            InstrumentClass::Forex
        } else if instrument.0.contains("IX.D.") {
            InstrumentClass::Index
        } else {
            InstrumentClass::Commodity
        }
    }
}

/// Optional forecast context supplied by the prediction subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketContext {
    /// Central predicted outcome. Falls back to the proposal's confidence score.
    #[serde(default)]
    pub base_prediction: Option<f64>,
    /// Volatility estimate. Falls back to the instrument-class default.
    #[serde(default)]
    pub volatility: Option<f64>,
    /// Explicit asset class. Falls back to inference from the instrument code.
    #[serde(default)]
    pub instrument_class: Option<InstrumentClass>,
}

/// A proposed trade awaiting pre-trade validation.
///
/// Construct through [`TradeProposal::new`], which rejects values no broker
/// would accept. Fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeProposal {
    instrument: Instrument,
    direction: Direction,
    size: Decimal,
    entry_price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    confidence: f64,
    market_context: Option<MarketContext>,
}

impl TradeProposal {
    pub fn new(
        instrument: Instrument,
        direction: Direction,
        size: Decimal,
        entry_price: Decimal,
        confidence: f64,
    ) -> Result<Self> {
        if instrument.0.trim().is_empty() {
            return Err(Error::InvalidProposal {
                reason: "instrument code is empty".to_string(),
            });
        }
        if size <= Decimal::ZERO {
            return Err(Error::InvalidProposal {
                reason: format!("size must be positive, got {}", size),
            });
        }
        if entry_price <= Decimal::ZERO {
            return Err(Error::InvalidProposal {
                reason: format!("entry price must be positive, got {}", entry_price),
            });
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::InvalidProposal {
                reason: format!("confidence must be within [0, 1], got {}", confidence),
            });
        }

        Ok(Self {
            instrument,
            direction,
            size,
            entry_price,
            stop_loss: None,
            take_profit: None,
            confidence,
            market_context: None,
        })
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: Decimal) -> Self {
        self.take_profit = Some(take_profit);
        self
    }

    pub fn with_market_context(mut self, context: MarketContext) -> Self {
        self.market_context = Some(context);
        self
    }

    /// The same proposal at a different size.
    pub fn resized(&self, size: Decimal) -> Result<Self> {
        if size <= Decimal::ZERO {
            return Err(Error::InvalidProposal {
                reason: format!("size must be positive, got {}", size),
            });
        }
        Ok(Self { size, ..self.clone() })
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn size(&self) -> Decimal {
        self.size
    }

    pub fn entry_price(&self) -> Decimal {
        self.entry_price
    }

    pub fn stop_loss(&self) -> Option<Decimal> {
        self.stop_loss
    }

    pub fn take_profit(&self) -> Option<Decimal> {
        self.take_profit
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn market_context(&self) -> Option<&MarketContext> {
        self.market_context.as_ref()
    }

    /// The asset class, preferring the explicit context value.
    pub fn instrument_class(&self) -> InstrumentClass {
        self.market_context
            .as_ref()
            .and_then(|ctx| ctx.instrument_class)
            .unwrap_or_else(|| InstrumentClass::from_instrument(&self.instrument))
    }
}

/// A position as reported by the broker. This is a read-only snapshot used as
/// the comparison operand during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub deal_id: DealId,
    pub instrument: Instrument,
    pub direction: Direction,
    pub size: Decimal,
    /// The broker's opening level (entry price).
    pub level: Decimal,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub pnl: Option<Decimal>,
}
