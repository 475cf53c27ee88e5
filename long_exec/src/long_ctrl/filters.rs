//! # Filters
//!
//! Numeric primitives used to shape signals inside longitudinal control.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;
use util::maths::clamp;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// First order low pass filter.
///
/// Each sample is `y = gain * y_prev + (1 - gain) * u`, so a gain of 0 passes the input
/// through and a gain of 1 holds the previous value.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LowpassFilter {
    value: f64,
    gain: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl LowpassFilter {
    pub fn new(initial: f64, gain: f64) -> Self {
        Self {
            value: initial,
            gain
        }
    }

    /// Pass a new sample through the filter and return the filtered value.
    pub fn filter(&mut self, u: f64) -> f64 {
        self.value = self.gain * self.value + (1.0 - self.gain) * u;
        self.value
    }

    /// Reset the filter state to the given value.
    pub fn reset(&mut self, value: f64) {
        self.value = value;
    }

    /// Change the gain, keeping the current state.
    pub fn set_gain(&mut self, gain: f64) {
        self.gain = gain;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Move from `prev` towards `input` with the rate of change limited to
/// `[min_rate, max_rate]` over the time step `dt_s`.
pub fn apply_diff_limit_filter(input: f64, prev: f64, dt_s: f64, max_rate: f64, min_rate: f64) -> f64 {
    if dt_s <= 0.0 {
        return prev;
    }

    let diff_raw = (input - prev) / dt_s;
    let diff = clamp(diff_raw, min_rate, max_rate);

    prev + diff * dt_s
}

/// Rate limit with the symmetric bound `|rate| <= |lim_rate|`.
///
/// Only the magnitude of `lim_rate` is used, so negative jerk setpoints behave the same as
/// positive ones.
pub fn apply_symmetric_diff_limit_filter(input: f64, prev: f64, dt_s: f64, lim_rate: f64) -> f64 {
    let max_rate = lim_rate.abs();
    apply_diff_limit_filter(input, prev, dt_s, max_rate, -max_rate)
}
