//! Longitudinal control parameters
//!
//! Parameters are grouped the same way they are laid out in `long_ctrl.toml`. The whole set is
//! held behind a [`ParamsHandle`] so that a tuning tool can swap in a new set while the
//! controller is running, the controller reads one snapshot per cycle and so never sees a
//! partially updated set.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for longitudinal control
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Params {

    /// Nominal period of the control cycle.
    ///
    /// Units: seconds
    pub ctrl_period_s: f64,

    /// Time between issuing a command and the vehicle responding to it.
    ///
    /// Units: seconds
    pub delay_compensation_time_s: f64,

    /// Distance between the front and rear axles, used to measure the slope of the trajectory.
    ///
    /// Units: meters
    pub wheel_base_m: f64,

    /// Feature enable flags
    pub enable: EnableParams,

    /// Thresholds governing the control state machine
    pub state_transition: StateTransitionParams,

    /// Velocity feedback controller used in the drive state
    pub drive: DriveParams,

    /// Smooth stop profile used in the stopping state
    pub smooth_stop: SmoothStopParams,

    /// Setpoints for the stopped state
    pub stopped: SetpointParams,

    /// Setpoints for the emergency state
    pub emergency: SetpointParams,

    /// Output acceleration and jerk limits
    pub limits: LimitParams,

    /// Slope compensation
    pub slope: SlopeParams
}

/// Enable flags for the optional behaviours of the controller.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EnableParams {
    /// Use the smooth stop profile when approaching a stop point
    pub smooth_stop: bool,

    /// Enter emergency if the stop point is overshot
    pub overshoot_emergency: bool,

    /// Enter emergency if the vehicle is too far from the trajectory
    pub large_tracking_error_emergency: bool,

    /// Compensate the command for the road slope
    pub slope_compensation: bool,

    /// Remain stopped until the lateral controller reports the steering has converged
    pub keep_stopped_until_steer_convergence: bool,

    /// Hold the brake just before a stop point
    pub brake_keeping_before_stop: bool
}

/// Thresholds used to decide when the control state changes.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StateTransitionParams {
    /// Stop distance above which the vehicle departs from the stopped state.
    ///
    /// Units: meters
    pub drive_state_stop_dist_m: f64,

    /// Extra stop distance (hysteresis) needed to depart from the stopping state.
    ///
    /// Units: meters
    pub drive_state_offset_stop_dist_m: f64,

    /// Stop distance below which the stopping state is entered.
    ///
    /// Units: meters
    pub stopping_state_stop_dist_m: f64,

    /// How long the vehicle must be still before it is considered stopped.
    ///
    /// Units: seconds
    pub stopped_state_entry_duration_time_s: f64,

    /// Speed below which the vehicle may be considered still.
    ///
    /// Units: meters/second
    pub stopped_state_entry_vel_ms: f64,

    /// Acceleration below which the vehicle may be considered still.
    ///
    /// Units: meters/second^2
    pub stopped_state_entry_acc_mss: f64,

    /// Distance past the stop point that triggers an emergency.
    ///
    /// Units: meters
    pub emergency_state_overshoot_stop_dist_m: f64,

    /// Maximum distance to the nearest trajectory point before the vehicle is far from the
    /// trajectory.
    ///
    /// Units: meters
    pub emergency_state_traj_trans_dev_m: f64,

    /// Maximum heading difference to the nearest trajectory point before the vehicle is far
    /// from the trajectory.
    ///
    /// Units: radians
    pub emergency_state_traj_rot_dev_rad: f64
}

/// Parameters of the drive state feedback controller.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DriveParams {
    /// Proportional gain
    pub k_p: f64,

    /// Integral gain
    pub k_i: f64,

    /// Derivative gain
    pub k_d: f64,

    /// Maximum total controller output (m/s^2)
    pub max_out_mss: f64,

    /// Minimum total controller output (m/s^2)
    pub min_out_mss: f64,

    /// Maximum proportional contribution (m/s^2)
    pub max_p_effort_mss: f64,

    /// Minimum proportional contribution (m/s^2)
    pub min_p_effort_mss: f64,

    /// Maximum integral contribution (m/s^2)
    pub max_i_effort_mss: f64,

    /// Minimum integral contribution (m/s^2)
    pub min_i_effort_mss: f64,

    /// Maximum derivative contribution (m/s^2)
    pub max_d_effort_mss: f64,

    /// Minimum derivative contribution (m/s^2)
    pub min_d_effort_mss: f64,

    /// Low pass filter gain applied to the velocity error, in [0, 1].
    pub lpf_vel_error_gain: f64,

    /// Low pass filter gain applied to the measured acceleration, in [0, 1].
    pub lpf_acc_gain: f64,

    /// Speed above which the integral term accumulates.
    ///
    /// Units: meters/second
    pub current_vel_threshold_pid_integration_ms: f64,

    /// Deceleration held just before a stop point when brake keeping is enabled.
    ///
    /// Units: meters/second^2
    pub brake_keeping_acc_mss: f64
}

/// Parameters of the smooth stop profile.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SmoothStopParams {
    /// Weakest allowed strong deceleration (m/s^2)
    pub max_strong_acc_mss: f64,

    /// Strongest allowed strong deceleration (m/s^2)
    pub min_strong_acc_mss: f64,

    /// Deceleration used while creeping towards the stop point (m/s^2)
    pub weak_acc_mss: f64,

    /// Deceleration used when the stop point has been passed a little (m/s^2)
    pub weak_stop_acc_mss: f64,

    /// Deceleration used to hold the vehicle or when the stop point has been passed a lot
    /// (m/s^2)
    pub strong_stop_acc_mss: f64,

    /// Speed above which the vehicle is considered fast (m/s)
    pub max_fast_vel_ms: f64,

    /// Speed above which the vehicle is considered running (m/s)
    pub min_running_vel_ms: f64,

    /// Acceleration above which the vehicle is considered running (m/s^2)
    pub min_running_acc_mss: f64,

    /// Longest expected time to stop before the strong deceleration is used (s)
    pub weak_stop_time_s: f64,

    /// Stop distance (negative, past the stop point) below which the weak stop deceleration is
    /// used (m)
    pub weak_stop_dist_m: f64,

    /// Stop distance (negative, past the stop point) below which the strong stop deceleration
    /// is used (m)
    pub strong_stop_dist_m: f64
}

/// Velocity, acceleration and jerk setpoints for a state which ramps to a fixed command.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct SetpointParams {
    /// Target velocity (m/s)
    pub vel_ms: f64,

    /// Target acceleration, its magnitude also limits the velocity ramp rate (m/s^2)
    pub acc_mss: f64,

    /// Jerk magnitude limiting the acceleration ramp rate (m/s^3)
    pub jerk_msss: f64
}

/// Limits on the published command.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LimitParams {
    /// Maximum acceleration (m/s^2)
    pub max_acc_mss: f64,

    /// Minimum acceleration (m/s^2)
    pub min_acc_mss: f64,

    /// Maximum jerk (m/s^3)
    pub max_jerk_msss: f64,

    /// Minimum jerk (m/s^3)
    pub min_jerk_msss: f64
}

/// Slope compensation parameters.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SlopeParams {
    /// If true the slope is measured from the trajectory geometry, otherwise from the filtered
    /// pose pitch.
    pub use_trajectory_for_pitch: bool,

    /// Low pass filter gain applied to the pose pitch, in [0, 1].
    pub lpf_pitch_gain: f64,

    /// Maximum pitch used for compensation (rad)
    pub max_pitch_rad: f64,

    /// Minimum pitch used for compensation (rad)
    pub min_pitch_rad: f64
}

/// Shared handle to the active parameter snapshot.
///
/// Cloning the handle shares the same underlying parameters.
#[derive(Debug, Clone)]
pub struct ParamsHandle {
    inner: Arc<RwLock<Arc<Params>>>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reasons a parameter set may be rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ParamsError {
    #[error("Parameter {0} must be strictly positive, found {1}")]
    NotPositive(&'static str, f64),

    #[error("Parameter {0} must not be negative, found {1}")]
    Negative(&'static str, f64),

    #[error("Parameter {0} must be finite")]
    NotFinite(&'static str),

    #[error("Bounds {0} are inverted (min {1} > max {2})")]
    InvertedBounds(&'static str, f64, f64),

    #[error("Bounds {0} must contain zero (min {1}, max {2})")]
    ZeroNotInBounds(&'static str, f64, f64),

    #[error("Filter gain {0} must be in [0, 1], found {1}")]
    InvalidGain(&'static str, f64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Params {
    /// Check that the parameter set is consistent.
    pub fn validate(&self) -> Result<(), ParamsError> {
        positive("ctrl_period_s", self.ctrl_period_s)?;
        non_negative("delay_compensation_time_s", self.delay_compensation_time_s)?;
        positive("wheel_base_m", self.wheel_base_m)?;

        let st = &self.state_transition;
        non_negative(
            "stopped_state_entry_duration_time_s", st.stopped_state_entry_duration_time_s)?;
        non_negative("stopped_state_entry_vel_ms", st.stopped_state_entry_vel_ms)?;
        non_negative("stopped_state_entry_acc_mss", st.stopped_state_entry_acc_mss)?;
        non_negative("drive_state_offset_stop_dist_m", st.drive_state_offset_stop_dist_m)?;
        positive("emergency_state_traj_trans_dev_m", st.emergency_state_traj_trans_dev_m)?;
        positive("emergency_state_traj_rot_dev_rad", st.emergency_state_traj_rot_dev_rad)?;
        finite("drive_state_stop_dist_m", st.drive_state_stop_dist_m)?;
        finite("stopping_state_stop_dist_m", st.stopping_state_stop_dist_m)?;
        finite("emergency_state_overshoot_stop_dist_m", st.emergency_state_overshoot_stop_dist_m)?;

        let d = &self.drive;
        finite("k_p", d.k_p)?;
        finite("k_i", d.k_i)?;
        finite("k_d", d.k_d)?;
        ordered("drive out", d.min_out_mss, d.max_out_mss)?;
        ordered("drive p effort", d.min_p_effort_mss, d.max_p_effort_mss)?;
        ordered("drive i effort", d.min_i_effort_mss, d.max_i_effort_mss)?;
        ordered("drive d effort", d.min_d_effort_mss, d.max_d_effort_mss)?;
        gain("lpf_vel_error_gain", d.lpf_vel_error_gain)?;
        gain("lpf_acc_gain", d.lpf_acc_gain)?;
        non_negative(
            "current_vel_threshold_pid_integration_ms",
            d.current_vel_threshold_pid_integration_ms)?;
        finite("brake_keeping_acc_mss", d.brake_keeping_acc_mss)?;

        let ss = &self.smooth_stop;
        ordered("smooth stop strong acc", ss.min_strong_acc_mss, ss.max_strong_acc_mss)?;
        finite("weak_acc_mss", ss.weak_acc_mss)?;
        finite("weak_stop_acc_mss", ss.weak_stop_acc_mss)?;
        finite("strong_stop_acc_mss", ss.strong_stop_acc_mss)?;
        non_negative("max_fast_vel_ms", ss.max_fast_vel_ms)?;
        non_negative("min_running_vel_ms", ss.min_running_vel_ms)?;
        non_negative("min_running_acc_mss", ss.min_running_acc_mss)?;
        non_negative("weak_stop_time_s", ss.weak_stop_time_s)?;
        ordered("smooth stop dist", ss.strong_stop_dist_m, ss.weak_stop_dist_m)?;

        for (name, sp) in [("stopped", &self.stopped), ("emergency", &self.emergency)].iter() {
            finite(*name, sp.vel_ms)?;
            finite(*name, sp.acc_mss)?;
            finite(*name, sp.jerk_msss)?;
        }

        let l = &self.limits;
        ordered("acc limits", l.min_acc_mss, l.max_acc_mss)?;
        contains_zero("acc limits", l.min_acc_mss, l.max_acc_mss)?;
        ordered("jerk limits", l.min_jerk_msss, l.max_jerk_msss)?;
        contains_zero("jerk limits", l.min_jerk_msss, l.max_jerk_msss)?;

        let s = &self.slope;
        gain("lpf_pitch_gain", s.lpf_pitch_gain)?;
        ordered("pitch limits", s.min_pitch_rad, s.max_pitch_rad)?;

        Ok(())
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            ctrl_period_s: 0.03,
            delay_compensation_time_s: 0.17,
            wheel_base_m: 2.79,
            enable: EnableParams {
                smooth_stop: true,
                overshoot_emergency: true,
                large_tracking_error_emergency: true,
                slope_compensation: false,
                keep_stopped_until_steer_convergence: true,
                brake_keeping_before_stop: false
            },
            state_transition: StateTransitionParams {
                drive_state_stop_dist_m: 0.5,
                drive_state_offset_stop_dist_m: 1.0,
                stopping_state_stop_dist_m: 0.5,
                stopped_state_entry_duration_time_s: 0.1,
                stopped_state_entry_vel_ms: 0.1,
                stopped_state_entry_acc_mss: 0.1,
                emergency_state_overshoot_stop_dist_m: 1.5,
                emergency_state_traj_trans_dev_m: 3.0,
                emergency_state_traj_rot_dev_rad: 0.7
            },
            drive: DriveParams {
                k_p: 1.0,
                k_i: 0.1,
                k_d: 0.0,
                max_out_mss: 1.0,
                min_out_mss: -1.0,
                max_p_effort_mss: 1.0,
                min_p_effort_mss: -1.0,
                max_i_effort_mss: 0.3,
                min_i_effort_mss: -0.3,
                max_d_effort_mss: 0.0,
                min_d_effort_mss: 0.0,
                lpf_vel_error_gain: 0.9,
                lpf_acc_gain: 0.2,
                current_vel_threshold_pid_integration_ms: 0.5,
                brake_keeping_acc_mss: -0.2
            },
            smooth_stop: SmoothStopParams {
                max_strong_acc_mss: -0.5,
                min_strong_acc_mss: -0.8,
                weak_acc_mss: -0.3,
                weak_stop_acc_mss: -0.8,
                strong_stop_acc_mss: -3.4,
                max_fast_vel_ms: 0.5,
                min_running_vel_ms: 0.01,
                min_running_acc_mss: 0.01,
                weak_stop_time_s: 0.8,
                weak_stop_dist_m: -0.3,
                strong_stop_dist_m: -0.5
            },
            stopped: SetpointParams {
                vel_ms: 0.0,
                acc_mss: -3.4,
                jerk_msss: -5.0
            },
            emergency: SetpointParams {
                vel_ms: 0.0,
                acc_mss: -5.0,
                jerk_msss: -3.0
            },
            limits: LimitParams {
                max_acc_mss: 3.0,
                min_acc_mss: -5.0,
                max_jerk_msss: 2.0,
                min_jerk_msss: -5.0
            },
            slope: SlopeParams {
                use_trajectory_for_pitch: false,
                lpf_pitch_gain: 0.95,
                max_pitch_rad: 0.1,
                min_pitch_rad: -0.1
            }
        }
    }
}

impl SmoothStopParams {
    /// The strongest deceleration the smooth stop profile may ever command.
    pub fn strongest_acc_mss(&self) -> f64 {
        self.min_strong_acc_mss
            .min(self.max_strong_acc_mss)
            .min(self.weak_acc_mss)
            .min(self.weak_stop_acc_mss)
            .min(self.strong_stop_acc_mss)
    }
}

impl Default for ParamsHandle {
    /// A handle to the default parameters, which are always valid.
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Params::default())))
        }
    }
}

impl ParamsHandle {
    /// Create a new handle, validating the initial parameters.
    pub fn new(params: Params) -> Result<Self, ParamsError> {
        params.validate()?;

        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(params)))
        })
    }

    /// Get the current parameter snapshot.
    ///
    /// The snapshot is immutable, later updates do not affect it.
    pub fn snapshot(&self) -> Arc<Params> {
        // A poisoned lock still holds a complete snapshot
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone()
        }
    }

    /// Replace the whole parameter set.
    ///
    /// The new set is validated first, if it is invalid the active set is kept.
    pub fn update(&self, params: Params) -> Result<(), ParamsError> {
        params.validate()?;

        let new = Arc::new(params);
        match self.inner.write() {
            Ok(mut g) => *g = new,
            Err(p) => *p.into_inner() = new
        }

        Ok(())
    }

    /// Edit a copy of the current parameters and swap it in.
    ///
    /// The read-modify-write happens under the write lock so concurrent edits are not lost.
    pub fn update_with<F>(&self, f: F) -> Result<(), ParamsError>
    where
        F: FnOnce(&mut Params)
    {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(p) => p.into_inner()
        };

        let mut params = (**guard).clone();
        f(&mut params);
        params.validate()?;
        *guard = Arc::new(params);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn finite(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if value.is_finite() {
        Ok(())
    }
    else {
        Err(ParamsError::NotFinite(name))
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ParamsError> {
    finite(name, value)?;
    if value > 0.0 {
        Ok(())
    }
    else {
        Err(ParamsError::NotPositive(name, value))
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ParamsError> {
    finite(name, value)?;
    if value >= 0.0 {
        Ok(())
    }
    else {
        Err(ParamsError::Negative(name, value))
    }
}

fn ordered(name: &'static str, min: f64, max: f64) -> Result<(), ParamsError> {
    finite(name, min)?;
    finite(name, max)?;
    if min <= max {
        Ok(())
    }
    else {
        Err(ParamsError::InvertedBounds(name, min, max))
    }
}

fn contains_zero(name: &'static str, min: f64, max: f64) -> Result<(), ParamsError> {
    if min <= 0.0 && max >= 0.0 {
        Ok(())
    }
    else {
        Err(ParamsError::ZeroNotInBounds(name, min, max))
    }
}

fn gain(name: &'static str, value: f64) -> Result<(), ParamsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    }
    else {
        Err(ParamsError::InvalidGain(name, value))
    }
}
