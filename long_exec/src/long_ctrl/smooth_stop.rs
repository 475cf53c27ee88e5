//! # Smooth stop
//!
//! Open loop deceleration profile used in the stopping state. On entry a "strong" deceleration
//! is chosen which would stop the vehicle at the predicted stop point. While the vehicle is
//! predicted to take a long time to stop the strong deceleration is used, close to stopping it
//! switches to a gentle "weak" deceleration so the stop is comfortable, and once stopped it
//! holds the vehicle with the strong stop deceleration. Overshooting the stop point switches
//! straight to the stop decelerations.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use serde::Serialize;

// Internal
use super::cmd_history::VelHistory;
use super::params::SmoothStopParams;
use util::maths::clamp;
use util::time::seconds_between;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Time the weak deceleration is held after the vehicle stops running.
///
/// Units: seconds
const WEAK_ACC_HOLD_TIME_S: f64 = 0.5;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// State of a single smooth stop manoeuvre.
#[derive(Debug, Clone)]
pub struct SmoothStop {
    /// Deceleration chosen on entry to stop at the predicted stop point
    strong_acc_mss: f64,

    /// Last time the weak deceleration was selected while running
    weak_acc_time: DateTime<Utc>,

    phase: SmoothStopPhase
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Which part of the profile produced the last output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SmoothStopPhase {
    /// Far from stopping, using the strong deceleration
    FastApproach,

    /// About to stop, using the weak deceleration
    Running,

    /// Slightly past the stop point
    WeakStop,

    /// Stopped, or well past the stop point
    StrongStop
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SmoothStop {
    /// Begin a new manoeuvre from the predicted velocity and distance to the stop point.
    pub fn init(
        pred_vel_ms: f64,
        pred_stop_dist_m: f64,
        now: DateTime<Utc>,
        params: &SmoothStopParams
    ) -> Self {
        let strong_acc_mss = if pred_stop_dist_m < f64::EPSILON {
            params.min_strong_acc_mss
        }
        else {
            clamp(
                -pred_vel_ms.powi(2) / (2.0 * pred_stop_dist_m),
                params.min_strong_acc_mss,
                params.max_strong_acc_mss
            )
        };

        Self {
            strong_acc_mss,
            weak_acc_time: now,
            phase: SmoothStopPhase::FastApproach
        }
    }

    /// Calculate the deceleration for this cycle.
    ///
    /// The output is never stronger than [`SmoothStopParams::strongest_acc_mss`].
    pub fn calculate(
        &mut self,
        stop_dist_m: f64,
        vel_ms: f64,
        acc_mss: f64,
        vel_hist: &VelHistory,
        delay_s: f64,
        now: DateTime<Utc>,
        params: &SmoothStopParams
    ) -> f64 {
        let strong_acc_mss = clamp(
            self.strong_acc_mss, params.min_strong_acc_mss, params.max_strong_acc_mss);

        let (phase, acc) = if stop_dist_m < params.strong_stop_dist_m {
            (SmoothStopPhase::StrongStop, params.strong_stop_acc_mss)
        }
        else if stop_dist_m < params.weak_stop_dist_m {
            (SmoothStopPhase::WeakStop, params.weak_stop_acc_mss)
        }
        else if vel_ms.abs() > params.min_running_vel_ms
            || acc_mss.abs() > params.min_running_acc_mss
        {
            let is_fast = vel_ms.abs() > params.max_fast_vel_ms;
            let use_strong = match vel_hist.time_to_stop(now) {
                Some(t) => t > params.weak_stop_time_s + delay_s,
                None => is_fast
            };

            if use_strong {
                (SmoothStopPhase::FastApproach, strong_acc_mss)
            }
            else {
                self.weak_acc_time = now;
                (SmoothStopPhase::Running, params.weak_acc_mss)
            }
        }
        else if seconds_between(self.weak_acc_time, now) < WEAK_ACC_HOLD_TIME_S {
            (SmoothStopPhase::Running, params.weak_acc_mss)
        }
        else {
            (SmoothStopPhase::StrongStop, params.strong_stop_acc_mss)
        };

        self.phase = phase;

        acc.max(params.strongest_acc_mss())
    }

    pub fn phase(&self) -> SmoothStopPhase {
        self.phase
    }

    pub fn strong_acc_mss(&self) -> f64 {
        self.strong_acc_mss
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::long_ctrl::params::Params;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_init_strong_acc() {
        let params = Params::default().smooth_stop;

        // 2 m/s over 4 m needs 0.5 m/s^2
        let ss = SmoothStop::init(2.0, 4.0, t(0), &params);
        assert_relative_eq!(ss.strong_acc_mss(), -0.5);

        // Clamped to the strongest allowed
        let ss = SmoothStop::init(5.0, 1.0, t(0), &params);
        assert_relative_eq!(ss.strong_acc_mss(), params.min_strong_acc_mss);

        // Already at the stop point
        let ss = SmoothStop::init(1.0, -0.1, t(0), &params);
        assert_relative_eq!(ss.strong_acc_mss(), params.min_strong_acc_mss);
    }

    #[test]
    fn test_phases() {
        let params = Params::default().smooth_stop;
        let hist = VelHistory::new(0.1);
        let mut ss = SmoothStop::init(3.0, 6.0, t(0), &params);

        // Fast with no history uses the strong deceleration
        let acc = ss.calculate(3.0, 2.0, -0.5, &hist, 0.17, t(100), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::FastApproach);
        assert_relative_eq!(acc, -0.75);

        // Slow but running uses the weak deceleration
        let acc = ss.calculate(0.2, 0.2, -0.3, &hist, 0.17, t(200), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::Running);
        assert_relative_eq!(acc, params.weak_acc_mss);

        // Stopped, weak deceleration is held for a while then the strong stop
        ss.calculate(0.1, 0.0, 0.0, &hist, 0.17, t(500), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::Running);
        let acc = ss.calculate(0.1, 0.0, 0.0, &hist, 0.17, t(800), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::StrongStop);
        assert_relative_eq!(acc, params.strong_stop_acc_mss);

        // Overshoot
        let acc = ss.calculate(-0.4, 0.5, 0.0, &hist, 0.17, t(900), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::WeakStop);
        assert_relative_eq!(acc, params.weak_stop_acc_mss);
        ss.calculate(-0.6, 0.5, 0.0, &hist, 0.17, t(1000), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::StrongStop);
    }

    #[test]
    fn test_time_to_stop_selects_phase() {
        let params = Params::default().smooth_stop;
        let mut ss = SmoothStop::init(1.0, 2.0, t(0), &params);

        // Decelerating slowly, 1.0 m/s falling at 0.1 m/s^2, takes ~10 s to stop
        let mut slow = VelHistory::new(0.1);
        for i in 0..5 {
            slow.push(t(i * 100), 1.04 - 0.01 * i as f64);
        }
        ss.calculate(1.0, 1.0, -0.1, &slow, 0.17, t(400), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::FastApproach);

        // Decelerating quickly, stops within the weak stop time
        let mut quick = VelHistory::new(0.1);
        for i in 0..5 {
            quick.push(t(i * 100), 0.9 - 0.1 * i as f64);
        }
        ss.calculate(1.0, 0.5, -1.0, &quick, 0.17, t(400), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::Running);
    }

    #[test]
    fn test_time_to_stop_threshold_includes_delay_once() {
        let params = Params::default().smooth_stop;
        let delay_s = 0.17;
        let mut ss = SmoothStop::init(1.0, 2.0, t(0), &params);

        // Stops 1.05 s from now, later than the weak stop time plus the delay
        let mut later = VelHistory::new(0.1);
        for i in 0..5 {
            later.push(t(i * 100), 1.45 - 0.1 * i as f64);
        }
        assert!(1.05 > params.weak_stop_time_s + delay_s);
        ss.calculate(1.0, 0.4, -1.0, &later, delay_s, t(400), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::FastApproach);

        // Stops 0.1 s from now, inside the delay. Without an estimate this speed would be fast
        let mut imminent = VelHistory::new(0.1);
        for i in 0..5 {
            imminent.push(t(i * 100), 3.0 - 0.6 * i as f64);
        }
        let acc = ss.calculate(1.0, 0.6, -6.0, &imminent, delay_s, t(400), &params);
        assert_eq!(ss.phase(), SmoothStopPhase::Running);
        assert_relative_eq!(acc, params.weak_acc_mss);
    }

    #[test]
    fn test_never_exceeds_strongest() {
        let params = Params::default().smooth_stop;
        let strongest = params.strongest_acc_mss();

        let mut hist = VelHistory::new(0.1);
        let mut ss = SmoothStop::init(8.0, 0.5, t(0), &params);

        let mut x = 0.3f64;
        for i in 0..500 {
            // Deterministic pseudo-random sequence of inputs
            x = (x * 3.7 + 0.13).fract();
            let stop_dist = 4.0 * x - 1.5;
            let vel = 6.0 * ((x * 7.0).fract() - 0.3);
            let acc = 2.0 * ((x * 13.0).fract() - 0.5);

            hist.push(t(i * 100), vel);
            let out = ss.calculate(stop_dist, vel, acc, &hist, 0.17, t(i * 100), &params);

            assert!(out >= strongest);
            assert!(out <= 0.0);
        }
    }
}
