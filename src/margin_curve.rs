//! Tiered maintenance-margin curve.
//!
//! Required margin maps to a maintenance ratio through three tiers keyed by
//! the magnitude of the requirement. Ratios are monotonically non-decreasing
//! across tiers: larger exposure leaves less headroom before liquidation,
//! the opposite of a flat percentage which under-protects large positions.

use crate::types::Cash;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarginTier {
    /// Upper bound on required margin for this tier; `None` = unbounded.
    pub upto: Option<Cash>,
    /// Maintenance ratio applied to the full requirement.
    pub ratio: Decimal,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MarginCurveError {
    #[error("Tier ratios must be non-decreasing: tier {index} ratio {ratio} below previous")]
    RatioNotMonotonic { index: usize, ratio: Decimal },

    #[error("Tier bounds must be strictly ascending: tier {index}")]
    BoundNotAscending { index: usize },

    #[error("Tier ratio must lie in (0, 1]: tier {index} ratio {ratio}")]
    RatioOutOfRange { index: usize, ratio: Decimal },

    #[error("Last tier must be unbounded")]
    LastTierBounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCurve {
    tiers: [MarginTier; 3],
}

impl MarginCurve {
    /// Validated at startup; a misordered tier table is a config error, not
    /// something to discover during a liquidation check.
    pub fn new(tiers: [MarginTier; 3]) -> Result<Self, MarginCurveError> {
        let mut prev_ratio = Decimal::ZERO;
        let mut prev_bound: Option<Cash> = None;

        for (index, tier) in tiers.iter().enumerate() {
            if tier.ratio <= Decimal::ZERO || tier.ratio > Decimal::ONE {
                return Err(MarginCurveError::RatioOutOfRange {
                    index,
                    ratio: tier.ratio,
                });
            }
            if tier.ratio < prev_ratio {
                return Err(MarginCurveError::RatioNotMonotonic {
                    index,
                    ratio: tier.ratio,
                });
            }
            prev_ratio = tier.ratio;

            match (prev_bound, tier.upto) {
                (Some(prev), Some(bound)) if bound <= prev => {
                    return Err(MarginCurveError::BoundNotAscending { index });
                }
                _ => {}
            }
            if tier.upto.is_some() {
                prev_bound = tier.upto;
            }
        }

        if tiers[2].upto.is_some() {
            return Err(MarginCurveError::LastTierBounded);
        }

        Ok(Self { tiers })
    }

    pub fn ratio_for(&self, required_margin: Cash) -> Decimal {
        for tier in &self.tiers {
            match tier.upto {
                Some(bound) if required_margin > bound => continue,
                _ => return tier.ratio,
            }
        }
        self.tiers[2].ratio
    }

    pub fn maintenance_margin(&self, required_margin: Cash) -> Cash {
        required_margin.mul(self.ratio_for(required_margin))
    }

    /// Breach test: maintenance has caught up with equity.
    pub fn is_immediate_liquidation_eligible(&self, equity: Cash, required_margin: Cash) -> bool {
        if required_margin.is_zero() || required_margin.is_negative() {
            return false;
        }
        self.maintenance_margin(required_margin) >= equity
    }

    pub fn tiers(&self) -> &[MarginTier; 3] {
        &self.tiers
    }
}

impl Default for MarginCurve {
    fn default() -> Self {
        Self::new([
            MarginTier {
                upto: Some(Cash::new(dec!(50_000))),
                ratio: dec!(0.50),
            },
            MarginTier {
                upto: Some(Cash::new(dec!(200_000))),
                ratio: dec!(0.65),
            },
            MarginTier {
                upto: None,
                ratio: dec!(0.80),
            },
        ])
        .expect("default tiers are monotonic")
    }
}
