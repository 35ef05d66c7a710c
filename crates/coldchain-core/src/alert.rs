use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance inside either configured bound at which a reading is reported as
/// a warning instead of normal. Expressed in the instrument's own unit.
pub const DEFAULT_WARNING_BAND: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }

    pub fn is_alerting(&self) -> bool {
        !matches!(self, AlertLevel::Normal)
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "normal" => Ok(AlertLevel::Normal),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("Unknown alert level: {other}")),
        }
    }
}

/// Zone boundaries used by the evaluator.
///
/// A value outside `[min, max]` is critical. Inside the range, a value within
/// `warning_band` of either bound is a warning. A band of zero disables the
/// warning zone entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub warning_band: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_band: DEFAULT_WARNING_BAND,
        }
    }
}

impl AlertThresholds {
    pub fn new(warning_band: f64) -> Self {
        let warning_band = if warning_band.is_finite() && warning_band > 0.0 {
            warning_band
        } else {
            0.0
        };
        Self { warning_band }
    }

    pub fn evaluate(&self, value: f64, min_value: f64, max_value: f64) -> AlertLevel {
        if !value.is_finite() || value < min_value || value > max_value {
            return AlertLevel::Critical;
        }
        if self.warning_band > 0.0
            && (value - min_value <= self.warning_band || max_value - value <= self.warning_band)
        {
            return AlertLevel::Warning;
        }
        AlertLevel::Normal
    }
}

pub fn evaluate(value: f64, min_value: f64, max_value: f64) -> AlertLevel {
    AlertThresholds::default().evaluate(value, min_value, max_value)
}

/// Returns whichever bound `value` is closest to. Ties resolve to the lower bound.
pub fn nearest_limit(value: f64, min_value: f64, max_value: f64) -> f64 {
    if (value - min_value).abs() <= (value - max_value).abs() {
        min_value
    } else {
        max_value
    }
}
