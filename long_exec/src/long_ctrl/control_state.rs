//! # Control state machine
//!
//! The controller is always in exactly one of four states:
//!
//! - `Drive`: following the trajectory velocity with feedback control
//! - `Stopping`: approaching a stop point with the smooth stop profile
//! - `Stopped`: holding the vehicle still
//! - `Emergency`: ramping to the emergency setpoints
//!
//! [`next_state`] decides the transitions. It is a pure function of its inputs, the only
//! memory the state machine needs is when the vehicle was last seen moving, which is tracked
//! separately by [`StoppedTracker`].

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// Internal
use super::control_data::Motion;
use super::params::Params;
use util::time::seconds_between;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Inputs to a state transition decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionInputs {
    /// Signed distance to the stop point.
    ///
    /// Units: meters
    pub stop_dist_m: f64,

    /// True once the vehicle has been still for the stopped entry duration
    pub stopped_long_enough: bool,

    /// True if the lateral controller has converged its steering
    pub is_steer_converged: bool
}

/// Tracks the last time the vehicle was observed moving.
#[derive(Debug, Clone, Default)]
pub struct StoppedTracker {
    last_running_time: Option<DateTime<Utc>>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlState {
    Drive,
    Stopping,
    Stopped,
    Emergency
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for ControlState {
    fn default() -> Self {
        ControlState::Stopped
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlState::Drive => "DRIVE",
            ControlState::Stopping => "STOPPING",
            ControlState::Stopped => "STOPPED",
            ControlState::Emergency => "EMERGENCY"
        };
        write!(f, "{}", s)
    }
}

impl ControlState {
    /// True if moving from `self` to `next` is a departure into `Drive`.
    pub fn is_departure(&self, next: ControlState) -> bool {
        next == ControlState::Drive
            && matches!(self, ControlState::Stopping | ControlState::Stopped)
    }
}

impl StoppedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the motion observed at `now` and return true if the vehicle has been still for
    /// longer than the stopped entry duration.
    ///
    /// The first observation starts the clock, so a vehicle which is still from the start is
    /// considered stopped once the duration has elapsed.
    pub fn update(&mut self, now: DateTime<Utc>, motion: &Motion, params: &Params) -> bool {
        let st = &params.state_transition;

        let is_running = motion.vel_ms.abs() > st.stopped_state_entry_vel_ms
            || motion.acc_mss.abs() > st.stopped_state_entry_acc_mss;

        let last = match self.last_running_time {
            Some(t) if !is_running => t,
            _ => {
                self.last_running_time = Some(now);
                now
            }
        };

        seconds_between(last, now) > st.stopped_state_entry_duration_time_s
    }

    pub fn last_running_time(&self) -> Option<DateTime<Utc>> {
        self.last_running_time
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Decide the control state for this cycle.
pub fn next_state(current: ControlState, inputs: &TransitionInputs, params: &Params) -> ControlState {
    let st = &params.state_transition;
    let en = &params.enable;
    let stop_dist = inputs.stop_dist_m;

    let departure_from_stopping =
        stop_dist > st.drive_state_stop_dist_m + st.drive_state_offset_stop_dist_m;
    let departure_from_stopped = stop_dist > st.drive_state_stop_dist_m;
    let keep_stopped = en.keep_stopped_until_steer_convergence && !inputs.is_steer_converged;
    let stopping = stop_dist < st.stopping_state_stop_dist_m;
    let stopped = inputs.stopped_long_enough;
    let emergency = en.overshoot_emergency
        && stop_dist < -st.emergency_state_overshoot_stop_dist_m;

    match current {
        ControlState::Drive => {
            if emergency {
                ControlState::Emergency
            }
            else if en.smooth_stop {
                if stopping {
                    ControlState::Stopping
                }
                else {
                    ControlState::Drive
                }
            }
            else if stopped && !departure_from_stopped {
                ControlState::Stopped
            }
            else {
                ControlState::Drive
            }
        },
        ControlState::Stopping => {
            if emergency {
                ControlState::Emergency
            }
            else if stopped {
                ControlState::Stopped
            }
            else if departure_from_stopping {
                ControlState::Drive
            }
            else {
                ControlState::Stopping
            }
        },
        ControlState::Stopped => {
            if !keep_stopped && departure_from_stopped {
                ControlState::Drive
            }
            else {
                ControlState::Stopped
            }
        },
        ControlState::Emergency => {
            if stopped && !emergency {
                ControlState::Stopped
            }
            else {
                ControlState::Emergency
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn inputs(stop_dist_m: f64, stopped_long_enough: bool) -> TransitionInputs {
        TransitionInputs {
            stop_dist_m,
            stopped_long_enough,
            is_steer_converged: true
        }
    }

    #[test]
    fn test_drive_transitions() {
        let mut params = Params::default();
        params.state_transition.stopping_state_stop_dist_m = 12.0;

        // Stop point 10 m ahead with a 12 m stopping distance
        assert_eq!(
            next_state(ControlState::Drive, &inputs(10.0, false), &params),
            ControlState::Stopping
        );
        params.state_transition.stopping_state_stop_dist_m = 5.0;
        assert_eq!(
            next_state(ControlState::Drive, &inputs(10.0, false), &params),
            ControlState::Drive
        );

        // Overshoot
        assert_eq!(
            next_state(ControlState::Drive, &inputs(-2.0, false), &params),
            ControlState::Emergency
        );
        params.enable.overshoot_emergency = false;
        assert_eq!(
            next_state(ControlState::Drive, &inputs(-2.0, false), &params),
            ControlState::Stopping
        );

        // Without smooth stop the vehicle goes straight to stopped
        params.enable.smooth_stop = false;
        assert_eq!(
            next_state(ControlState::Drive, &inputs(0.2, true), &params),
            ControlState::Stopped
        );
        assert_eq!(
            next_state(ControlState::Drive, &inputs(0.2, false), &params),
            ControlState::Drive
        );
        assert_eq!(
            next_state(ControlState::Drive, &inputs(5.0, true), &params),
            ControlState::Drive
        );
    }

    #[test]
    fn test_stopping_transitions() {
        let params = Params::default();

        assert_eq!(
            next_state(ControlState::Stopping, &inputs(-2.0, true), &params),
            ControlState::Emergency
        );
        assert_eq!(
            next_state(ControlState::Stopping, &inputs(0.1, true), &params),
            ControlState::Stopped
        );

        // Hysteresis, departure needs 0.5 + 1.0 m
        assert_eq!(
            next_state(ControlState::Stopping, &inputs(1.2, false), &params),
            ControlState::Stopping
        );
        assert_eq!(
            next_state(ControlState::Stopping, &inputs(1.6, false), &params),
            ControlState::Drive
        );
        assert!(ControlState::Stopping.is_departure(ControlState::Drive));
    }

    #[test]
    fn test_stopped_transitions() {
        let params = Params::default();

        assert_eq!(
            next_state(ControlState::Stopped, &inputs(0.6, true), &params),
            ControlState::Drive
        );
        assert_eq!(
            next_state(ControlState::Stopped, &inputs(0.4, true), &params),
            ControlState::Stopped
        );

        // Steering not converged keeps the vehicle stopped
        let mut i = inputs(10.0, true);
        i.is_steer_converged = false;
        assert_eq!(next_state(ControlState::Stopped, &i, &params), ControlState::Stopped);

        let mut params = params;
        params.enable.keep_stopped_until_steer_convergence = false;
        assert_eq!(next_state(ControlState::Stopped, &i, &params), ControlState::Drive);
    }

    #[test]
    fn test_emergency_transitions() {
        let params = Params::default();

        assert_eq!(
            next_state(ControlState::Emergency, &inputs(-2.0, true), &params),
            ControlState::Emergency
        );
        assert_eq!(
            next_state(ControlState::Emergency, &inputs(-1.0, false), &params),
            ControlState::Emergency
        );
        assert_eq!(
            next_state(ControlState::Emergency, &inputs(-1.0, true), &params),
            ControlState::Stopped
        );
        assert!(!ControlState::Emergency.is_departure(ControlState::Stopped));
    }

    #[test]
    fn test_stopped_tracker() {
        let params = Params::default();
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        let at = |ms| t0 + Duration::milliseconds(ms);
        let still = Motion::default();
        let moving = Motion { vel_ms: 1.0, acc_mss: 0.0 };

        let mut tracker = StoppedTracker::new();
        assert!(!tracker.update(at(0), &still, &params));
        assert!(!tracker.update(at(100), &still, &params));
        assert!(tracker.update(at(150), &still, &params));

        // Motion restarts the clock
        assert!(!tracker.update(at(200), &moving, &params));
        assert_eq!(tracker.last_running_time(), Some(at(200)));
        assert!(!tracker.update(at(250), &still, &params));
        assert!(tracker.update(at(350), &still, &params));
    }
}
