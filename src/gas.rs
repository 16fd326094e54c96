//! Fee bump policy for replacement transactions.
//!
//! A replacement broadcast by the mining monitor reuses the original nonce, so
//! nodes only accept it when it pays more than the transaction it replaces.
//! `GasBump` turns the replacement attempt number into a fee multiplier which
//! the signer applies to its own fee estimate. The gas limit is not touched
//! here: it is carried over only when the caller set it explicitly.

use serde::{Deserialize, Serialize};

/// Percentage-based fee bump, compounded per replacement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasBump {
    /// Multiplier applied per attempt, in percent (default: 112, i.e. +12%)
    pub multiplier_percent: u64,
    /// Ceiling for the compounded multiplier, in percent (default: 300)
    pub max_multiplier_percent: u64,
}

impl Default for GasBump {
    fn default() -> Self {
        Self {
            multiplier_percent: 112,
            max_multiplier_percent: 300,
        }
    }
}

impl GasBump {
    /// No bump at all: replacements are priced like the original.
    pub fn none() -> Self {
        Self {
            multiplier_percent: 100,
            max_multiplier_percent: 100,
        }
    }

    pub fn with_multiplier_percent(mut self, percent: u64) -> Self {
        self.multiplier_percent = percent;
        self
    }

    pub fn with_max_multiplier_percent(mut self, percent: u64) -> Self {
        self.max_multiplier_percent = percent;
        self
    }

    /// Fee multiplier for the given attempt (0 = original broadcast).
    ///
    /// Never below 1.0 and never above the configured ceiling.
    pub fn multiplier(&self, attempt: u32) -> f64 {
        let step = self.multiplier_percent.max(100) as f64 / 100.0;
        let ceiling = self.max_multiplier_percent.max(100) as f64 / 100.0;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        step.powi(exponent).min(ceiling)
    }

    /// Apply the attempt's multiplier to a fee value in wei.
    pub fn apply(&self, fee: u128, attempt: u32) -> u128 {
        bump_fee(fee, self.multiplier(attempt))
    }
}

/// Scale a fee by `multiplier`, rounding up so a bump is never lost to
/// truncation on small values.
pub fn bump_fee(fee: u128, multiplier: f64) -> u128 {
    if multiplier <= 1.0 {
        return fee;
    }
    (fee as f64 * multiplier).ceil() as u128
}
