use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::graph::HandoverEdge;

pub const DISTANCE_ZERO_DEFAULT: f64 = 5000.0;
pub const DISTANCE_ONE_DEFAULT: f64 = 3000.0;
pub const MINIMUM_WEIGHT_DEFAULT: f64 = 50.0;
pub const MINIMUM_WEIGHT_ADJUSTED_DEFAULT: f64 = 0.05;
pub const CONFIDENCE_DISTANCE_MODIFIER_DEFAULT: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfidenceError {
    #[error("distance_zero ({distance_zero}) must be >= distance_one ({distance_one})")]
    InvertedDistances {
        distance_zero: f64,
        distance_one: f64,
    },
    #[error("`{field}` must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },
}

/// Thresholds and sub-score weights used to turn distance and traffic
/// evidence into a confidence value.
///
/// Values are never mutated in place; [`ConfidenceConfig::with_updates`]
/// returns a new, validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceConfig {
    /// Distance (ft) from the airspace border at or above which distance
    /// evidence is zero.
    pub distance_zero: f64,
    /// Distance (ft) at or below which distance evidence is full.
    pub distance_one: f64,
    pub minimum_weight: f64,
    /// Threshold on an edge's share of its source airspace's outgoing traffic.
    pub minimum_weight_adjusted: f64,
    pub confidence_distance: f64,
    /// Applied to distance evidence when the aircraft is inside neither
    /// airspace. Expected to be <= 1.0.
    pub confidence_distance_modifier: f64,
    pub confidence_weight: f64,
    pub confidence_weight_adjusted: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            distance_zero: DISTANCE_ZERO_DEFAULT,
            distance_one: DISTANCE_ONE_DEFAULT,
            minimum_weight: MINIMUM_WEIGHT_DEFAULT,
            minimum_weight_adjusted: MINIMUM_WEIGHT_ADJUSTED_DEFAULT,
            confidence_distance: 1.0,
            confidence_distance_modifier: CONFIDENCE_DISTANCE_MODIFIER_DEFAULT,
            confidence_weight: 1.0,
            confidence_weight_adjusted: 1.0,
        }
    }
}

/// A partial set of confidence settings. Unset fields keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceUpdate {
    pub distance_zero: Option<f64>,
    pub distance_one: Option<f64>,
    pub minimum_weight: Option<f64>,
    pub minimum_weight_adjusted: Option<f64>,
    pub confidence_distance: Option<f64>,
    pub confidence_distance_modifier: Option<f64>,
    pub confidence_weight: Option<f64>,
    pub confidence_weight_adjusted: Option<f64>,
}

impl ConfidenceUpdate {
    /// Fields set in `later` win over fields set in `self`.
    pub fn overlay(self, later: ConfidenceUpdate) -> ConfidenceUpdate {
        ConfidenceUpdate {
            distance_zero: later.distance_zero.or(self.distance_zero),
            distance_one: later.distance_one.or(self.distance_one),
            minimum_weight: later.minimum_weight.or(self.minimum_weight),
            minimum_weight_adjusted: later
                .minimum_weight_adjusted
                .or(self.minimum_weight_adjusted),
            confidence_distance: later.confidence_distance.or(self.confidence_distance),
            confidence_distance_modifier: later
                .confidence_distance_modifier
                .or(self.confidence_distance_modifier),
            confidence_weight: later.confidence_weight.or(self.confidence_weight),
            confidence_weight_adjusted: later
                .confidence_weight_adjusted
                .or(self.confidence_weight_adjusted),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfidenceUpdate::default()
    }
}

impl ConfidenceConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        distance_zero: f64,
        distance_one: f64,
        minimum_weight: f64,
        minimum_weight_adjusted: f64,
        confidence_distance: f64,
        confidence_distance_modifier: f64,
        confidence_weight: f64,
        confidence_weight_adjusted: f64,
    ) -> Result<Self, ConfidenceError> {
        let config = Self {
            distance_zero,
            distance_one,
            minimum_weight,
            minimum_weight_adjusted,
            confidence_distance,
            confidence_distance_modifier,
            confidence_weight,
            confidence_weight_adjusted,
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `update` and validates the resulting configuration as a whole.
    ///
    /// A partial update of the distance pair is checked against the other
    /// field's current value. On error `self` is left as it was.
    pub fn with_updates(&self, update: ConfidenceUpdate) -> Result<Self, ConfidenceError> {
        let next = Self {
            distance_zero: update.distance_zero.unwrap_or(self.distance_zero),
            distance_one: update.distance_one.unwrap_or(self.distance_one),
            minimum_weight: update.minimum_weight.unwrap_or(self.minimum_weight),
            minimum_weight_adjusted: update
                .minimum_weight_adjusted
                .unwrap_or(self.minimum_weight_adjusted),
            confidence_distance: update
                .confidence_distance
                .unwrap_or(self.confidence_distance),
            confidence_distance_modifier: update
                .confidence_distance_modifier
                .unwrap_or(self.confidence_distance_modifier),
            confidence_weight: update.confidence_weight.unwrap_or(self.confidence_weight),
            confidence_weight_adjusted: update
                .confidence_weight_adjusted
                .unwrap_or(self.confidence_weight_adjusted),
        };
        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> Result<(), ConfidenceError> {
        for (field, value) in [
            ("distance_zero", self.distance_zero),
            ("distance_one", self.distance_one),
            ("minimum_weight", self.minimum_weight),
            ("minimum_weight_adjusted", self.minimum_weight_adjusted),
            ("confidence_distance", self.confidence_distance),
            (
                "confidence_distance_modifier",
                self.confidence_distance_modifier,
            ),
            ("confidence_weight", self.confidence_weight),
            ("confidence_weight_adjusted", self.confidence_weight_adjusted),
        ] {
            if !value.is_finite() {
                return Err(ConfidenceError::NotFinite { field, value });
            }
        }
        if self.distance_zero < self.distance_one {
            return Err(ConfidenceError::InvertedDistances {
                distance_zero: self.distance_zero,
                distance_one: self.distance_one,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceResult {
    pub distance1: Option<f64>,
    pub distance2: Option<f64>,
    pub weight: u64,
    pub weight_adjusted: f64,
    pub confidence_distance: f64,
    pub confidence_weight: f64,
    pub confidence_weight_adjusted: f64,
    pub confidence: f64,
}

/// Clamped linear interpolation that decreases as `x` grows: `y_lo` at or
/// above `x_hi`, `y_hi` at or below `x_lo`.
pub fn lerp(x: f64, x_hi: f64, x_lo: f64, y_lo: f64, y_hi: f64) -> f64 {
    if x >= x_hi {
        y_lo
    } else if x <= x_lo {
        y_hi
    } else {
        y_lo + (x_hi - x) / (x_hi - x_lo) * (y_hi - y_lo)
    }
}

/// Scores a candidate handover from airspace 1 to airspace 2.
///
/// `edge` is `None` when no transition between the two was ever observed.
/// Distance evidence only counts when both distances are given.
pub fn confidence(
    edge: Option<&HandoverEdge>,
    distance1: Option<f64>,
    distance2: Option<f64>,
    config: &ConfidenceConfig,
) -> ConfidenceResult {
    let (weight, weight_adjusted) = edge
        .map(|edge| (edge.weight, edge.weight_adjusted))
        .unwrap_or((0, 0.0));

    let raw_distance = match (distance1, distance2) {
        (Some(d1), Some(d2)) => {
            let ramp = |d| lerp(d, config.distance_zero, config.distance_one, 0.0, 1.0);
            if d1 == 0.0 {
                ramp(d2)
            } else if d2 == 0.0 {
                ramp(d1)
            } else {
                ramp(d2) * config.confidence_distance_modifier
            }
        }
        _ => 0.0,
    };

    let confidence_distance = raw_distance * config.confidence_distance;
    let confidence_weight = if weight as f64 >= config.minimum_weight {
        config.confidence_weight
    } else {
        0.0
    };
    let confidence_weight_adjusted = if weight_adjusted >= config.minimum_weight_adjusted {
        config.confidence_weight_adjusted
    } else {
        0.0
    };
    let total = confidence_distance + confidence_weight + confidence_weight_adjusted;
    debug!(
        weight,
        weight_adjusted,
        confidence_distance,
        confidence_weight,
        confidence_weight_adjusted,
        total,
        "computed handover confidence"
    );

    ConfidenceResult {
        distance1,
        distance2,
        weight,
        weight_adjusted,
        confidence_distance,
        confidence_weight,
        confidence_weight_adjusted,
        confidence: total,
    }
}
