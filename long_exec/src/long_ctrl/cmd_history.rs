//! # Command and velocity history
//!
//! The controller keeps two short histories:
//!
//! - [`CmdHistory`] holds the acceleration commands issued while driving. Commands take
//!   `delay_compensation_time_s` to act on the vehicle, so the ones still "in flight" are used
//!   to predict the velocity the vehicle will have once the next command takes effect.
//! - [`VelHistory`] holds the last half second of measured velocity, used by the smooth stop
//!   profile to estimate when the vehicle will come to rest.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

// Internal
use util::time::seconds_between;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Speeds below this are not worth predicting, the current velocity is returned as is.
///
/// Units: meters/second
pub const NEGLIGIBLE_VEL_MS: f64 = 0.1;

/// Length of the velocity history.
///
/// Units: seconds
pub const VEL_HISTORY_DURATION_S: f64 = 0.5;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// An acceleration command which was issued to the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CmdHistoryEntry {
    pub stamp: DateTime<Utc>,

    /// Units: meters/second^2
    pub acc_mss: f64
}

/// Time ordered history of issued acceleration commands.
#[derive(Debug, Clone, Default)]
pub struct CmdHistory {
    entries: VecDeque<CmdHistoryEntry>
}

/// Time ordered history of measured velocity, bounded by sample count.
#[derive(Debug, Clone)]
pub struct VelHistory {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    capacity: usize
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CmdHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command issued at `stamp`.
    ///
    /// Commands older than the previous entry are dropped to keep the history ordered. Old
    /// entries are evicted once the second oldest is more than `horizon_s` old, so that the
    /// oldest entry always covers the start of the horizon.
    pub fn push(&mut self, stamp: DateTime<Utc>, acc_mss: f64, horizon_s: f64) {
        if let Some(last) = self.entries.back() {
            if stamp < last.stamp {
                return;
            }
        }

        self.entries.push_back(CmdHistoryEntry { stamp, acc_mss });

        while self.entries.len() > 2
            && seconds_between(self.entries[1].stamp, stamp) > horizon_s
        {
            self.entries.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CmdHistoryEntry> {
        self.entries.iter()
    }

    /// Predict the velocity at `now + delay_s`.
    ///
    /// Commands are treated as acting on the speed magnitude. The part of the history issued
    /// within the last `delay_s` has not yet reached the vehicle, so it is integrated on top
    /// of the current speed. The prediction never changes direction, a prediction which
    /// crosses zero returns zero.
    pub fn predict_velocity(
        &self,
        vel_ms: f64,
        acc_mss: f64,
        now: DateTime<Utc>,
        delay_s: f64
    ) -> f64 {
        let vel_abs = vel_ms.abs();
        if vel_abs < NEGLIGIBLE_VEL_MS {
            return vel_ms
        }

        let pred_abs = if self.entries.is_empty() {
            vel_abs + acc_mss * vel_ms.signum() * delay_s
        }
        else {
            self.integrate_in_flight(vel_abs, now, delay_s)
        };

        if pred_abs > 0.0 {
            pred_abs.copysign(vel_ms)
        }
        else {
            0.0
        }
    }

    /// Integrate the commands inside the delay horizon on top of the current speed.
    ///
    /// Must not be called on an empty history.
    fn integrate_in_flight(&self, vel_abs: f64, now: DateTime<Utc>, delay_s: f64) -> f64 {
        let mut pred = vel_abs;

        for (i, entry) in self.entries.iter().enumerate() {
            let age_s = seconds_between(entry.stamp, now);
            if age_s >= delay_s {
                continue;
            }

            // History shorter than the horizon
            if i == 0 {
                return vel_abs + entry.acc_mss * delay_s
            }

            let prev = &self.entries[i - 1];
            let time_to_next_s = seconds_between(prev.stamp, entry.stamp)
                .min(delay_s - age_s);
            pred += prev.acc_mss * time_to_next_s;
        }

        if let Some(last) = self.entries.back() {
            pred += last.acc_mss * seconds_between(last.stamp, now);
        }

        pred
    }
}

impl VelHistory {
    /// Create a history holding [`VEL_HISTORY_DURATION_S`] worth of samples at the given
    /// cycle period, and never fewer than 2.
    pub fn new(ctrl_period_s: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: Self::capacity_for(ctrl_period_s)
        }
    }

    fn capacity_for(ctrl_period_s: f64) -> usize {
        let n = (VEL_HISTORY_DURATION_S / ctrl_period_s).floor();
        if n.is_finite() && n > 2.0 {
            n as usize
        }
        else {
            2
        }
    }

    /// Change the cycle period, dropping the oldest samples if the history shrinks.
    pub fn set_period(&mut self, ctrl_period_s: f64) {
        self.capacity = Self::capacity_for(ctrl_period_s);
        self.trim();
    }

    pub fn push(&mut self, stamp: DateTime<Utc>, vel_ms: f64) {
        self.samples.push_back((stamp, vel_ms));
        self.trim();
    }

    fn trim(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Estimate the time from `now` until the vehicle stops.
    ///
    /// A least squares line `v = a * t + b` is fitted through the history and extrapolated to
    /// zero. Returns `None` if the line cannot be fitted, is flat, or reached zero before `now`.
    pub fn time_to_stop(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.samples.is_empty() {
            return None
        }

        let n = self.samples.len() as f64;
        let ts: Vec<f64> = self.samples.iter()
            .map(|(stamp, _)| seconds_between(now, *stamp))
            .collect();
        let mean_t = ts.iter().sum::<f64>() / n;
        let mean_v = self.samples.iter().map(|(_, v)| v).sum::<f64>() / n;

        let mut cov_tv = 0.0;
        let mut var_t = 0.0;
        for (t, (_, v)) in ts.iter().zip(self.samples.iter()) {
            cov_tv += (t - mean_t) * (v - mean_v);
            var_t += (t - mean_t) * (t - mean_t);
        }

        if var_t < f64::EPSILON {
            return None
        }

        let a = cov_tv / var_t;
        let b = mean_v - a * mean_t;

        if a.abs() < f64::EPSILON {
            return None
        }

        let t_stop = -b / a;
        if t_stop <= 0.0 {
            return None
        }

        Some(t_stop)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_predict_trivial() {
        let hist = CmdHistory::new();

        // Negligible speed is returned unchanged
        assert_eq!(hist.predict_velocity(0.05, 3.0, t(0), 0.2), 0.05);
        assert_eq!(hist.predict_velocity(-0.05, 3.0, t(0), 0.2), -0.05);

        // Empty history extrapolates the measured acceleration
        assert_relative_eq!(hist.predict_velocity(2.0, 0.5, t(0), 0.2), 2.1);
        assert_relative_eq!(hist.predict_velocity(-2.0, -0.5, t(0), 0.2), -2.1);
    }

    #[test]
    fn test_predict_in_flight() {
        let mut hist = CmdHistory::new();
        hist.push(t(700), 1.0, 0.2);
        hist.push(t(850), 0.5, 0.2);

        // 0.05 s of the first command and 0.15 s of the second are still in flight
        assert_relative_eq!(
            hist.predict_velocity(2.0, 0.0, t(1000), 0.2), 2.125, epsilon = 1e-9);
        assert_relative_eq!(
            hist.predict_velocity(-2.0, 0.0, t(1000), 0.2), -2.125, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_short_history() {
        let mut hist = CmdHistory::new();
        hist.push(t(900), -1.0, 0.2);

        assert_relative_eq!(hist.predict_velocity(2.0, 0.0, t(1000), 0.2), 1.8);

        // Crossing zero is clamped rather than reversing
        hist.clear();
        hist.push(t(900), -5.0, 0.2);
        assert_eq!(hist.predict_velocity(0.5, 0.0, t(1000), 0.2), 0.0);
        assert_eq!(hist.predict_velocity(-0.5, 0.0, t(1000), 0.2), 0.0);
    }

    #[test]
    fn test_push_eviction() {
        let mut hist = CmdHistory::new();
        for i in 0..10 {
            hist.push(t(i * 100), 0.0, 0.25);
        }

        // Second oldest is always within the horizon
        let stamps: Vec<_> = hist.iter().map(|e| e.stamp).collect();
        assert_eq!(stamps, vec![t(600), t(700), t(800), t(900)]);

        // Out of order commands are dropped
        hist.push(t(850), 1.0, 0.25);
        assert_eq!(hist.len(), 4);
        assert!(hist.iter().all(|e| e.acc_mss == 0.0));
    }

    #[test]
    fn test_vel_history_capacity() {
        let mut hist = VelHistory::new(0.1);
        for i in 0..10 {
            hist.push(t(i * 100), 1.0);
        }
        assert_eq!(hist.len(), 5);

        hist.set_period(1.0);
        assert_eq!(hist.len(), 2);
    }

    #[test]
    fn test_time_to_stop() {
        let mut hist = VelHistory::new(0.1);

        // Decelerating at 1 m/s^2, 1 m/s at t = 1.0 s
        for i in 0..5 {
            hist.push(t(600 + i * 100), 1.4 - 0.1 * i as f64);
        }

        let tts = hist.time_to_stop(t(1000)).unwrap();
        assert_relative_eq!(tts, 1.0, epsilon = 1e-9);

        // A stop shorter than any delay is still an estimate
        assert_relative_eq!(hist.time_to_stop(t(1900)).unwrap(), 0.1, epsilon = 1e-9);

        // Extrapolated stop already in the past
        assert_eq!(hist.time_to_stop(t(2500)), None);

        // Constant velocity never stops
        let mut flat = VelHistory::new(0.1);
        for i in 0..5 {
            flat.push(t(i * 100), 1.0);
        }
        assert_eq!(flat.time_to_stop(t(500)), None);

        // A single sample has no slope
        let mut single = VelHistory::new(0.1);
        single.push(t(0), 1.0);
        assert_eq!(single.time_to_stop(t(0)), None);
    }
}
