// In crates/risk/src/margin.rs

use crate::types::MarginSettings;
use crate::{Error, Result};
use num_traits::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Intermediate values behind a sizing decision. Every field is always
/// populated (zero when a step was never reached) so logs never drop data.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MarginDetails {
    pub theoretical_max_units: Decimal,
    pub safe_max_units: Decimal,
    pub min_required_margin: Decimal,
    pub shortfall: Decimal,
    pub margin_utilization_pct: Decimal,
}

/// The result of a margin-safe sizing calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarginCalculation {
    pub safe_units: Decimal,
    pub required_margin: Decimal,
    pub available_margin: Decimal,
    pub safety_factor: Decimal,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub details: MarginDetails,
}

/// Outcome of checking an already-chosen size against available margin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarginCheck {
    pub is_valid: bool,
    pub required_margin: Decimal,
    pub utilization_pct: Decimal,
    pub reason: String,
}

/// Computes the largest position that fits in `available_margin` with a
/// `safety_factor` buffer.
///
/// A trade is never sized below `min_units`: when the margin cannot carry the
/// minimum viable position the calculation is blocked with zero units, even if
/// plain division would suggest a small positive size.
pub fn calculate_safe_units(
    available_margin: Decimal,
    margin_per_unit: Decimal,
    safety_factor: Decimal,
    min_units: Decimal,
    max_units: Option<Decimal>,
    size_increment: Decimal,
) -> MarginCalculation {
    let blocked = |reason: String, required_margin: Decimal, details: MarginDetails| {
        tracing::warn!(%available_margin, %margin_per_unit, %reason, "Margin sizing blocked");
        MarginCalculation {
            safe_units: Decimal::ZERO,
            required_margin,
            available_margin,
            safety_factor,
            is_blocked: true,
            block_reason: Some(reason),
            details,
        }
    };

    // --- Input validation ---
    if margin_per_unit <= Decimal::ZERO {
        return blocked(
            format!("Invalid margin per unit ({} <= 0)", margin_per_unit),
            Decimal::ZERO,
            MarginDetails::default(),
        );
    }
    if safety_factor < Decimal::ONE {
        return blocked(
            format!("Invalid safety factor ({} < 1)", safety_factor),
            Decimal::ZERO,
            MarginDetails::default(),
        );
    }
    if size_increment <= Decimal::ZERO {
        return blocked(
            format!("Invalid size increment ({} <= 0)", size_increment),
            Decimal::ZERO,
            MarginDetails::default(),
        );
    }
    if available_margin < Decimal::ZERO {
        return blocked(
            format!("Negative available margin ({})", available_margin),
            Decimal::ZERO,
            MarginDetails::default(),
        );
    }
    if let Some(max) = max_units {
        if max < min_units {
            return blocked(
                format!("Maximum units ({}) below minimum ({})", max, min_units),
                Decimal::ZERO,
                MarginDetails::default(),
            );
        }
    }

    let Some(sized) = size_within_margin(
        available_margin,
        margin_per_unit,
        safety_factor,
        min_units,
        max_units,
        size_increment,
    ) else {
        return blocked(
            "Arithmetic overflow while sizing position".to_string(),
            Decimal::ZERO,
            MarginDetails::default(),
        );
    };

    match sized {
        Sizing::Blocked { reason, required_margin, details } => blocked(reason, required_margin, details),
        Sizing::Sized { safe_units, required_margin, details } => {
            tracing::info!(
                %safe_units,
                %required_margin,
                utilization_pct = %details.margin_utilization_pct,
                "Margin-safe size computed"
            );
            MarginCalculation {
                safe_units,
                required_margin,
                available_margin,
                safety_factor,
                is_blocked: false,
                block_reason: None,
                details,
            }
        }
    }
}

enum Sizing {
    Blocked { reason: String, required_margin: Decimal, details: MarginDetails },
    Sized { safe_units: Decimal, required_margin: Decimal, details: MarginDetails },
}

/// The arithmetic core of [`calculate_safe_units`]. `None` means a checked
/// operation overflowed.
fn size_within_margin(
    available: Decimal,
    per_unit: Decimal,
    safety_factor: Decimal,
    min_units: Decimal,
    max_units: Option<Decimal>,
    increment: Decimal,
) -> Option<Sizing> {
    let theoretical_max_units = available.checked_div(per_unit)?;
    let safe_max_units = theoretical_max_units.checked_div(safety_factor)?;
    let min_required_margin = min_units.checked_mul(per_unit)?.checked_mul(safety_factor)?;

    let mut details = MarginDetails {
        theoretical_max_units,
        safe_max_units,
        min_required_margin,
        ..MarginDetails::default()
    };

    // --- Minimum viable position ---
    if available < min_required_margin {
        details.shortfall = min_required_margin - available;
        return Some(Sizing::Blocked {
            reason: format!(
                "Insufficient margin for minimum position. Need {:.2}, have {:.2} (shortfall {:.2})",
                min_required_margin, available, details.shortfall
            ),
            required_margin: min_required_margin,
            details,
        });
    }

    if safe_max_units < min_units {
        return Some(Sizing::Blocked {
            reason: format!(
                "Safe units ({:.3}) below minimum ({})",
                safe_max_units, min_units
            ),
            required_margin: min_units.checked_mul(per_unit)?,
            details,
        });
    }

    // --- Cap, round, and make sure the rounded size still fits ---
    let capped = match max_units {
        Some(max) if safe_max_units > max => {
            tracing::debug!(%max, "Units capped at maximum");
            max
        }
        _ => safe_max_units,
    };

    let per_unit_with_buffer = per_unit.checked_mul(safety_factor)?;
    let mut safe_units = round_to_increment(capped, increment)?;
    let mut required_margin = safe_units.checked_mul(per_unit_with_buffer)?;

    if required_margin > available {
        let fit = available.checked_div(per_unit_with_buffer)?.min(capped);
        safe_units = floor_to_increment(fit, increment)?;
        required_margin = safe_units.checked_mul(per_unit_with_buffer)?;
    }

    if safe_units < min_units || safe_units.is_zero() {
        return Some(Sizing::Blocked {
            reason: format!(
                "Rounded size ({}) below minimum ({}) at increment {}",
                safe_units, min_units, increment
            ),
            required_margin: min_required_margin,
            details,
        });
    }

    details.margin_utilization_pct = utilization_pct(required_margin, available)?;

    Some(Sizing::Sized {
        safe_units: safe_units.normalize(),
        required_margin: required_margin.normalize(),
        details,
    })
}

fn round_to_increment(units: Decimal, increment: Decimal) -> Option<Decimal> {
    units.checked_div(increment)?.round().checked_mul(increment)
}

fn floor_to_increment(units: Decimal, increment: Decimal) -> Option<Decimal> {
    units.checked_div(increment)?.floor().checked_mul(increment)
}

fn utilization_pct(required: Decimal, available: Decimal) -> Option<Decimal> {
    if available.is_zero() {
        return Some(Decimal::ZERO);
    }
    required.checked_div(available)?.checked_mul(dec!(100))
}

/// Position size from a fixed risk budget and a stop distance.
pub fn size_from_risk(
    risk_amount: Decimal,
    stop_distance_points: Decimal,
    point_value: Decimal,
    size_increment: Decimal,
) -> Result<Decimal> {
    if stop_distance_points <= Decimal::ZERO || point_value <= Decimal::ZERO {
        return Err(Error::InvalidParameters(format!(
            "stop distance ({}) and point value ({}) must be positive",
            stop_distance_points, point_value
        )));
    }
    if size_increment <= Decimal::ZERO {
        return Err(Error::InvalidParameters(format!(
            "size increment must be positive, got {}",
            size_increment
        )));
    }
    let overflow = || Error::InvalidParameters("arithmetic overflow in risk sizing".to_string());
    let raw = risk_amount
        .checked_div(stop_distance_points.checked_mul(point_value).ok_or_else(overflow)?)
        .ok_or_else(overflow)?;
    round_to_increment(raw, size_increment)
        .map(|units| units.normalize())
        .ok_or_else(overflow)
}

/// Margin sizing with configured defaults.
#[derive(Debug, Clone)]
pub struct MarginSizer {
    safety_factor: Decimal,
    min_units: Decimal,
    max_units: Option<Decimal>,
    size_increment: Decimal,
    high_utilization_pct: Decimal,
}

impl MarginSizer {
    pub fn new(settings: &MarginSettings) -> Result<Self> {
        let to_decimal = |name: &str, value: f64| {
            Decimal::from_f64(value).ok_or_else(|| {
                Error::InvalidParameters(format!("{} ({}) is not representable", name, value))
            })
        };

        let safety_factor = to_decimal("safety_factor", settings.safety_factor)?;
        if safety_factor < Decimal::ONE {
            return Err(Error::InvalidParameters(format!(
                "safety_factor must be >= 1, got {}",
                safety_factor
            )));
        }
        let size_increment = to_decimal("size_increment", settings.size_increment)?;
        if size_increment <= Decimal::ZERO {
            return Err(Error::InvalidParameters(format!(
                "size_increment must be positive, got {}",
                size_increment
            )));
        }

        Ok(Self {
            safety_factor,
            min_units: to_decimal("min_units", settings.min_units)?,
            max_units: settings
                .max_units
                .map(|max| to_decimal("max_units", max))
                .transpose()?,
            size_increment,
            high_utilization_pct: to_decimal("high_utilization_pct", settings.high_utilization_pct)?,
        })
    }

    pub fn safety_factor(&self) -> Decimal {
        self.safety_factor
    }

    pub fn min_units(&self) -> Decimal {
        self.min_units
    }

    /// Sizes with the configured bounds, additionally capped at `cap` units.
    /// The configured `max_units` still applies when `cap` is larger.
    pub fn size_capped(
        &self,
        available_margin: Decimal,
        margin_per_unit: Decimal,
        cap: Decimal,
    ) -> MarginCalculation {
        let max_units = match self.max_units {
            Some(max) => max.min(cap),
            None => cap,
        };
        self.size_with_bounds(available_margin, margin_per_unit, self.min_units, Some(max_units))
    }

    /// Sizes with the configured bounds.
    pub fn size(&self, available_margin: Decimal, margin_per_unit: Decimal) -> MarginCalculation {
        self.size_with_bounds(available_margin, margin_per_unit, self.min_units, self.max_units)
    }

    /// Sizes with instrument-specific bounds.
    pub fn size_with_bounds(
        &self,
        available_margin: Decimal,
        margin_per_unit: Decimal,
        min_units: Decimal,
        max_units: Option<Decimal>,
    ) -> MarginCalculation {
        calculate_safe_units(
            available_margin,
            margin_per_unit,
            self.safety_factor,
            min_units,
            max_units,
            self.size_increment,
        )
    }

    /// Checks an already-chosen size against available margin.
    pub fn check_margin(
        &self,
        position_size: Decimal,
        margin_per_unit: Decimal,
        available_margin: Decimal,
    ) -> MarginCheck {
        let required_margin = position_size * margin_per_unit * self.safety_factor;

        if required_margin > available_margin {
            let shortfall = required_margin - available_margin;
            return MarginCheck {
                is_valid: false,
                required_margin,
                utilization_pct: Decimal::ZERO,
                reason: format!(
                    "Insufficient margin: need {:.2}, have {:.2} (shortfall: {:.2})",
                    required_margin, available_margin, shortfall
                ),
            };
        }

        let utilization_pct = utilization_pct(required_margin, available_margin).unwrap_or(Decimal::ZERO);
        if utilization_pct > self.high_utilization_pct {
            tracing::warn!(%utilization_pct, "High margin utilization");
        }

        MarginCheck {
            is_valid: true,
            required_margin,
            utilization_pct,
            reason: format!(
                "Margin OK: {:.2} required, {:.1}% utilization",
                required_margin, utilization_pct
            ),
        }
    }

    /// The smaller of the risk-budget size and the margin-safe size.
    pub fn optimal_size(
        &self,
        risk_amount: Decimal,
        stop_distance_points: Decimal,
        point_value: Decimal,
        available_margin: Decimal,
        margin_per_unit: Decimal,
    ) -> Result<MarginCalculation> {
        let risk_based = size_from_risk(
            risk_amount,
            stop_distance_points,
            point_value,
            self.size_increment,
        )?;

        let margin_calc = self.size(available_margin, margin_per_unit);
        if margin_calc.is_blocked {
            return Ok(margin_calc);
        }

        let cap = match self.max_units {
            Some(max) => risk_based.min(max),
            None => risk_based,
        };
        Ok(self.size_with_bounds(available_margin, margin_per_unit, self.min_units, Some(cap)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> MarginSizer {
        MarginSizer::new(&MarginSettings::default()).unwrap()
    }

    #[test]
    fn tiny_margin_is_blocked_instead_of_rounding_to_a_tradeable_size() {
        let calc = calculate_safe_units(dec!(0.05), dec!(3.0), dec!(1.2), dec!(0.1), None, dec!(0.1));
        assert!(calc.is_blocked);
        assert_eq!(calc.safe_units, Decimal::ZERO);
        assert_eq!(calc.details.min_required_margin, dec!(0.36));
        assert_eq!(calc.details.shortfall, dec!(0.31));
        assert!(calc.block_reason.unwrap().contains("Insufficient margin"));
    }

    #[test]
    fn realistic_account_sizes_within_margin() {
        let calc = calculate_safe_units(dec!(264.63), dec!(3.33), dec!(1.2), dec!(0.5), None, dec!(0.1));
        assert!(!calc.is_blocked);
        assert_eq!(calc.safe_units, dec!(66.2));
        assert!(calc.required_margin <= calc.available_margin);
        assert_eq!(calc.required_margin, dec!(264.5352));
        assert!(calc.details.margin_utilization_pct > dec!(99));
    }

    #[test]
    fn rounding_up_past_available_margin_shrinks_the_size() {
        // 10.032 / 1.2 = 8.36 rounds to 8.4, which needs 10.08.
        let calc = calculate_safe_units(dec!(10.032), dec!(1), dec!(1.2), dec!(0.1), None, dec!(0.1));
        assert!(!calc.is_blocked);
        assert_eq!(calc.safe_units, dec!(8.3));
        assert!(calc.required_margin <= dec!(10.032));
    }

    #[test]
    fn max_units_caps_the_size() {
        let calc = calculate_safe_units(dec!(1000), dec!(2), dec!(1.2), dec!(0.1), Some(dec!(5)), dec!(0.1));
        assert_eq!(calc.safe_units, dec!(5));
        assert_eq!(calc.required_margin, dec!(12));
    }

    #[test]
    fn invalid_inputs_are_blocked() {
        let zero_margin = calculate_safe_units(dec!(100), dec!(0), dec!(1.2), dec!(0.1), None, dec!(0.1));
        assert!(zero_margin.is_blocked);
        assert!(zero_margin.block_reason.unwrap().contains("Invalid margin per unit"));

        let weak_buffer = calculate_safe_units(dec!(100), dec!(1), dec!(0.9), dec!(0.1), None, dec!(0.1));
        assert!(weak_buffer.is_blocked);

        let inverted = calculate_safe_units(dec!(100), dec!(1), dec!(1.2), dec!(1), Some(dec!(0.5)), dec!(0.1));
        assert!(inverted.is_blocked);
    }

    #[test]
    fn check_margin_reports_shortfall() {
        let check = sizer().check_margin(dec!(10), dec!(3), dec!(30));
        assert!(!check.is_valid);
        assert!(check.reason.contains("shortfall: 6.00"));

        let check = sizer().check_margin(dec!(5), dec!(3), dec!(30));
        assert!(check.is_valid);
        assert_eq!(check.utilization_pct, dec!(60));
    }

    #[test]
    fn risk_based_size_requires_positive_stop() {
        assert!(size_from_risk(dec!(50), dec!(0), dec!(1), dec!(0.1)).is_err());
        assert_eq!(size_from_risk(dec!(50), dec!(20), dec!(1), dec!(0.1)).unwrap(), dec!(2.5));
    }

    #[test]
    fn optimal_size_takes_the_smaller_constraint() {
        // Margin alone would allow ~83 units; the risk budget allows 2.5.
        let calc = sizer()
            .optimal_size(dec!(50), dec!(20), dec!(1), dec!(100), dec!(1))
            .unwrap();
        assert!(!calc.is_blocked);
        assert_eq!(calc.safe_units, dec!(2.5));
    }

    #[test]
    fn caller_cap_never_exceeds_configured_max() {
        let sizer = MarginSizer::new(&MarginSettings {
            max_units: Some(5.0),
            ..MarginSettings::default()
        })
        .unwrap();

        let calc = sizer.size_capped(dec!(264.63), dec!(3.33), dec!(500));
        assert_eq!(calc.safe_units, dec!(5));

        let calc = sizer.size_capped(dec!(264.63), dec!(3.33), dec!(2));
        assert_eq!(calc.safe_units, dec!(2));

        let uncapped = self::sizer().size_capped(dec!(264.63), dec!(3.33), dec!(500));
        assert_eq!(uncapped.safe_units, dec!(66.2));
    }

    #[test]
    fn sizer_rejects_sub_unit_safety_factor() {
        let settings = MarginSettings {
            safety_factor: 0.8,
            ..MarginSettings::default()
        };
        assert!(matches!(MarginSizer::new(&settings), Err(Error::InvalidParameters(_))));
    }
}
