//! Longitudinal control module state

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;

// Internal
use super::*;
use crate::loc::{Odometry, Pose};
use util::{
    archive::{Archived, Archiver, ArchiveError},
    logger::Throttle,
    maths::clamp,
    module::State,
    params,
    session::Session,
    time::seconds_between
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Gravitational acceleration used for slope compensation.
///
/// Units: meters/second^2
pub const GRAVITY_MSS: f64 = 9.81;

/// Minimum time between odometry samples used to derive acceleration.
///
/// Units: seconds
const MIN_ODOM_DT_S: f64 = 1e-3;

/// Period of rate limited log messages.
///
/// Units: seconds
const LOG_THROTTLE_PERIOD_S: f64 = 3.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Longitudinal control module state
pub struct LongCtrl {
    params: ParamsHandle,

    trajectory: Option<Trajectory>,
    odometry: Option<Odometry>,
    prev_odometry: Option<Odometry>,

    /// Current control state
    state: ControlState,

    pid: PidController,
    lpf_vel_error: LowpassFilter,
    lpf_acc: LowpassFilter,
    lpf_pitch: LowpassFilter,

    /// Smooth stop manoeuvre, only present in the stopping state
    smooth_stop: Option<SmoothStop>,

    stopped_tracker: StoppedTracker,
    cmd_history: CmdHistory,
    vel_history: VelHistory,

    prev_shift: Shift,
    prev_control_time: Option<DateTime<Utc>>,

    /// Command before clamping and slope compensation
    prev_raw_cmd: Motion,

    /// Published command
    prev_cmd: Motion,

    traj_log_throttle: Throttle,
    emergency_log_throttle: Throttle,

    report: StatusReport,
    arch_report: Archiver,

    output: Option<LongitudinalCommand>,
    arch_output: Archiver
}

/// Input data to longitudinal control.
#[derive(Debug, Clone)]
pub struct InputData {
    /// Time of this cycle
    pub now: DateTime<Utc>,

    /// A new trajectory, or `None` if there isn't one this cycle.
    pub trajectory: Option<Vec<TrajectoryPoint>>,

    /// A new odometry sample, or `None` if there isn't one this cycle.
    pub odometry: Option<Odometry>,

    /// Current pose of the vehicle, or `None` if it couldn't be determined.
    pub pose: Option<Pose>,

    /// True if the lateral controller reports the steering has converged
    pub is_steer_converged: bool
}

/// The command produced by longitudinal control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LongitudinalCommand {
    pub stamp: DateTime<Utc>,

    /// Target speed, negative when reversing.
    ///
    /// Units: meters/second
    pub speed_ms: f64,

    /// Target acceleration along the direction of travel.
    ///
    /// Units: meters/second^2
    pub acc_mss: f64
}

/// Diagnostic values from a single cycle.
///
/// None of these values are used for control, they are for monitoring and tuning only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub stamp: Option<DateTime<Utc>>,

    /// True if the cycle was skipped because inputs were missing
    pub cycle_skipped: bool,

    pub dt_s: f64,

    pub control_state: ControlState,
    pub smooth_stop_phase: Option<SmoothStopPhase>,
    pub shift: Shift,
    pub is_far_from_trajectory: bool,
    pub nearest_idx: usize,
    pub stop_dist_m: f64,

    pub current_vel_ms: f64,
    pub current_acc_mss: f64,
    pub target_vel_ms: f64,
    pub target_acc_mss: f64,
    pub nearest_vel_ms: f64,
    pub nearest_acc_mss: f64,
    pub predicted_vel_ms: f64,

    pub vel_error_ms: f64,
    pub vel_error_filtered_ms: f64,
    pub pid_acc_mss: f64,
    pub pid_p_mss: f64,
    pub pid_i_mss: f64,
    pub pid_d_mss: f64,

    pub acc_cmd_raw_mss: f64,
    pub acc_cmd_clamped_mss: f64,
    pub acc_cmd_slope_mss: f64,
    pub acc_cmd_jerk_mss: f64,
    pub acc_cmd_published_mss: f64,
    pub vel_cmd_published_ms: f64,

    pub pitch_filtered_rad: f64,
    pub pitch_raw_pose_rad: f64,
    pub pitch_raw_traj_rad: f64,
    pub slope_angle_rad: f64
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Potential errors that can occur in longitudinal control.
#[derive(Debug, thiserror::Error)]
pub enum LongCtrlError {
    #[error("Could not load parameters: {0}")]
    ParamLoadError(params::LoadError),

    #[error("Invalid parameters: {0}")]
    InvalidParams(ParamsError),

    #[error("Could not initialise archiving: {0}")]
    ArchiveError(ArchiveError)
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for LongCtrl {
    fn default() -> Self {
        Self::with_handle(ParamsHandle::default())
    }
}

impl State for LongCtrl {
    type InitData = &'static str;
    type InitError = LongCtrlError;

    type InputData = InputData;
    type OutputData = Option<LongitudinalCommand>;
    type StatusReport = StatusReport;
    type ProcError = LongCtrlError;

    /// Initialise the LongCtrl module.
    ///
    /// Expected init data is the path to the parameter file, relative to the params directory.
    fn init(&mut self, init_data: Self::InitData, session: &Session)
        -> Result<(), Self::InitError>
    {
        let params: Params = params::load(init_data)
            .map_err(LongCtrlError::ParamLoadError)?;
        self.params.update(params)
            .map_err(LongCtrlError::InvalidParams)?;

        self.vel_history.set_period(self.params.snapshot().ctrl_period_s);

        self.arch_report = Archiver::from_path(session, "long_ctrl/status_report.csv")
            .map_err(LongCtrlError::ArchiveError)?;
        self.arch_output = Archiver::from_path(session, "long_ctrl/output.csv")
            .map_err(LongCtrlError::ArchiveError)?;

        Ok(())
    }

    /// Perform one control cycle.
    ///
    /// Outputs `None` if the cycle was skipped because the trajectory, pose or odometry are not
    /// yet available.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>
    {
        let now = input_data.now;

        self.report = StatusReport::default();
        self.report.stamp = Some(now);
        self.output = None;

        // ---- INPUTS ----

        if let Some(ref points) = input_data.trajectory {
            if let Err(e) = self.set_trajectory(points.clone()) {
                if self.traj_log_throttle.ready(now) {
                    warn!("Rejected new trajectory, keeping the previous one: {}", e);
                }
            }
        }

        if let Some(odom) = input_data.odometry {
            self.set_odometry(odom);
        }

        // One snapshot for the whole cycle
        let params = self.params.snapshot();
        self.lpf_vel_error.set_gain(params.drive.lpf_vel_error_gain);
        self.lpf_acc.set_gain(params.drive.lpf_acc_gain);
        self.lpf_pitch.set_gain(params.slope.lpf_pitch_gain);
        self.vel_history.set_period(params.ctrl_period_s);

        let dt_s = self.get_dt(now, &params);
        self.report.dt_s = dt_s;
        self.report.control_state = self.state;

        let pose = match (input_data.pose, self.is_ready()) {
            (Some(p), true) => p,
            _ => {
                trace!("LongCtrl inputs not ready, skipping cycle");
                self.report.cycle_skipped = true;
                return Ok((None, self.report.clone()))
            }
        };

        // ---- CONTROL ----

        let data = self.get_control_data(&pose, dt_s, &params);

        let cmd = if data.is_far_from_trajectory {
            self.far_from_trajectory_cmd(&data, now, &params)
        }
        else {
            self.update_control_state(&data, now, input_data.is_steer_converged, &params);
            self.calc_ctrl_cmd(&data, &pose, now, &params)
        };

        self.publish(cmd, &data, now);

        debug!(
            "LongCtrl {}: stop_dist {:.3} m, vel {:.3} m/s, cmd vel {:.3} m/s acc {:.3} m/s^2",
            self.state, data.stop_dist_m, data.current_motion.vel_ms, cmd.vel_ms, cmd.acc_mss
        );

        Ok((self.output, self.report.clone()))
    }
}

impl Archived for LongCtrl {
    fn write(&mut self) -> Result<(), ArchiveError> {
        self.arch_report.serialise(&self.report)?;

        if let Some(output) = self.output {
            self.arch_output.serialise(output)?;
        }

        Ok(())
    }
}

impl LongCtrl {
    /// Create a new controller with the given parameters.
    pub fn new(params: Params) -> Result<Self, ParamsError> {
        Ok(Self::with_handle(ParamsHandle::new(params)?))
    }

    fn with_handle(params: ParamsHandle) -> Self {
        let p = params.snapshot();

        Self {
            trajectory: None,
            odometry: None,
            prev_odometry: None,
            state: ControlState::Stopped,
            pid: PidController::new(),
            lpf_vel_error: LowpassFilter::new(0.0, p.drive.lpf_vel_error_gain),
            lpf_acc: LowpassFilter::new(0.0, p.drive.lpf_acc_gain),
            lpf_pitch: LowpassFilter::new(0.0, p.slope.lpf_pitch_gain),
            smooth_stop: None,
            stopped_tracker: StoppedTracker::new(),
            cmd_history: CmdHistory::new(),
            vel_history: VelHistory::new(p.ctrl_period_s),
            prev_shift: Shift::Forward,
            prev_control_time: None,
            prev_raw_cmd: Motion::default(),
            prev_cmd: Motion::default(),
            traj_log_throttle: Throttle::new(LOG_THROTTLE_PERIOD_S),
            emergency_log_throttle: Throttle::new(LOG_THROTTLE_PERIOD_S),
            report: StatusReport::default(),
            arch_report: Archiver::default(),
            output: None,
            arch_output: Archiver::default(),
            params
        }
    }

    /// Get a handle to the parameters, through which they can be updated while running.
    pub fn params_handle(&self) -> ParamsHandle {
        self.params.clone()
    }

    pub fn control_state(&self) -> ControlState {
        self.state
    }

    pub fn trajectory(&self) -> Option<&Trajectory> {
        self.trajectory.as_ref()
    }

    /// Replace the trajectory.
    ///
    /// If the new trajectory is invalid the previous one is kept.
    pub fn set_trajectory(&mut self, points: Vec<TrajectoryPoint>) -> Result<(), TrajectoryError> {
        self.trajectory = Some(Trajectory::new(points)?);
        Ok(())
    }

    /// Add a new odometry sample.
    ///
    /// Samples which are not newer than the latest one are ignored.
    pub fn set_odometry(&mut self, odom: Odometry) {
        if let Some(curr) = self.odometry {
            if odom.stamp <= curr.stamp {
                return;
            }
        }

        self.prev_odometry = self.odometry.replace(odom);
    }

    fn is_ready(&self) -> bool {
        self.trajectory.is_some() && self.odometry.is_some() && self.prev_odometry.is_some()
    }

    /// Time since the last cycle, clamped to between half and twice the nominal period.
    fn get_dt(&mut self, now: DateTime<Utc>, params: &Params) -> f64 {
        let period = params.ctrl_period_s;

        let dt = match self.prev_control_time.replace(now) {
            Some(prev) => seconds_between(prev, now),
            None => period
        };

        if dt.is_finite() {
            clamp(dt, 0.5 * period, 2.0 * period)
        }
        else {
            period
        }
    }

    /// Measured velocity and acceleration.
    ///
    /// Acceleration is differentiated from the two latest odometry samples then filtered.
    fn get_current_motion(&mut self) -> Motion {
        let (prev, curr) = match (self.prev_odometry, self.odometry) {
            (Some(p), Some(c)) => (p, c),
            _ => return Motion::default()
        };

        let dt = seconds_between(prev.stamp, curr.stamp).max(MIN_ODOM_DT_S);
        let acc = (curr.speed_ms - prev.speed_ms) / dt;

        Motion {
            vel_ms: curr.speed_ms,
            acc_mss: self.lpf_acc.filter(acc)
        }
    }

    /// Build the control data for this cycle.
    fn get_control_data(&mut self, pose: &Pose, dt_s: f64, params: &Params) -> ControlData {
        let current_motion = self.get_current_motion();

        self.report.current_vel_ms = current_motion.vel_ms;
        self.report.current_acc_mss = current_motion.acc_mss;

        let mut data = ControlData {
            dt_s,
            current_motion,
            nearest_idx: 0,
            shift: self.prev_shift,
            stop_dist_m: 0.0,
            slope_angle_rad: 0.0,
            is_far_from_trajectory: false
        };

        let traj = match self.trajectory {
            Some(ref t) => t,
            None => {
                data.is_far_from_trajectory = true;
                return data
            }
        };

        let st = &params.state_transition;
        let max_dist = st.emergency_state_traj_trans_dev_m;
        let max_yaw = st.emergency_state_traj_rot_dev_rad;

        data.nearest_idx = match traj.find_nearest_index(pose, max_dist, max_yaw) {
            Some(i) => i,
            None => {
                data.is_far_from_trajectory = true;
                self.report.is_far_from_trajectory = true;
                return data
            }
        };

        // Shift
        let nearest = traj.points()[data.nearest_idx];
        data.shift = Shift::from_target_vel(nearest.longitudinal_velocity_ms, self.prev_shift);
        if data.shift != self.prev_shift {
            debug!("Shift changed from {:?} to {:?}, resetting PID", self.prev_shift, data.shift);
            self.pid.reset();
        }
        self.prev_shift = data.shift;

        data.stop_dist_m = traj.stop_distance(pose, max_dist, max_yaw);

        // Pitch
        let raw_pitch = pose.get_pitch();
        let traj_pitch = traj.pitch_at(data.nearest_idx, params.wheel_base_m);
        let filtered_pitch = self.lpf_pitch.filter(raw_pitch);
        data.slope_angle_rad = if params.slope.use_trajectory_for_pitch {
            traj_pitch
        }
        else {
            filtered_pitch
        };

        self.report.nearest_idx = data.nearest_idx;
        self.report.nearest_vel_ms = nearest.longitudinal_velocity_ms;
        self.report.nearest_acc_mss = nearest.acceleration_mss;
        self.report.shift = data.shift;
        self.report.stop_dist_m = data.stop_dist_m;
        self.report.pitch_raw_pose_rad = raw_pitch;
        self.report.pitch_raw_traj_rad = traj_pitch;
        self.report.pitch_filtered_rad = filtered_pitch;
        self.report.slope_angle_rad = data.slope_angle_rad;

        data
    }

    /// Evaluate the state transition and perform the entry and exit actions.
    fn update_control_state(
        &mut self,
        data: &ControlData,
        now: DateTime<Utc>,
        is_steer_converged: bool,
        params: &Params
    ) {
        let inputs = TransitionInputs {
            stop_dist_m: data.stop_dist_m,
            stopped_long_enough: self.stopped_tracker.update(now, &data.current_motion, params),
            is_steer_converged
        };

        let prev = self.state;
        let next = next_state(prev, &inputs, params);

        if next == prev {
            return;
        }

        info!("Control state changed from {} to {}", prev, next);

        if prev == ControlState::Stopping {
            self.smooth_stop = None;
        }

        if next == ControlState::Stopping {
            let delay = params.delay_compensation_time_s;
            let vel = data.current_motion.vel_ms;
            let pred_vel = self.cmd_history.predict_velocity(
                vel, data.current_motion.acc_mss, now, delay);
            let pred_stop_dist = data.stop_dist_m - 0.5 * (pred_vel + vel) * delay;

            self.smooth_stop = Some(SmoothStop::init(
                pred_vel, pred_stop_dist, now, &params.smooth_stop));
        }

        if prev.is_departure(next) {
            self.pid.reset();
            self.lpf_vel_error.reset(0.0);

            // Don't start from a braking command or the vehicle is slow to move off
            self.prev_cmd.acc_mss = self.prev_cmd.acc_mss.max(0.0);
        }

        self.state = next;
    }

    /// Calculate the command for the current state, then shape it.
    fn calc_ctrl_cmd(
        &mut self,
        data: &ControlData,
        pose: &Pose,
        now: DateTime<Utc>,
        params: &Params
    ) -> Motion {
        let raw_cmd = match self.state {
            ControlState::Drive => self.calc_drive_cmd(data, pose, now, params),
            ControlState::Stopping => {
                let vel_hist = &self.vel_history;
                let smooth_stop = self.smooth_stop.get_or_insert_with(|| SmoothStop::init(
                    data.current_motion.vel_ms,
                    data.stop_dist_m,
                    now,
                    &params.smooth_stop
                ));

                let acc = smooth_stop.calculate(
                    data.stop_dist_m,
                    data.current_motion.vel_ms,
                    data.current_motion.acc_mss,
                    vel_hist,
                    params.delay_compensation_time_s,
                    now,
                    &params.smooth_stop
                );
                self.report.smooth_stop_phase = Some(smooth_stop.phase());

                Motion {
                    vel_ms: params.stopped.vel_ms,
                    acc_mss: acc
                }
            },
            ControlState::Stopped => Motion {
                vel_ms: params.stopped.vel_ms,
                acc_mss: apply_symmetric_diff_limit_filter(
                    params.stopped.acc_mss,
                    self.prev_raw_cmd.acc_mss,
                    data.dt_s,
                    params.stopped.jerk_msss
                )
            },
            ControlState::Emergency => self.calc_emergency_cmd(data.dt_s, now, params)
        };

        self.prev_raw_cmd = raw_cmd;
        self.report.acc_cmd_raw_mss = raw_cmd.acc_mss;

        Motion {
            vel_ms: raw_cmd.vel_ms,
            acc_mss: self.calc_filtered_acc(raw_cmd.acc_mss, data, now, params)
        }
    }

    /// Feedback control towards the target at the delay compensated pose.
    fn calc_drive_cmd(
        &mut self,
        data: &ControlData,
        pose: &Pose,
        now: DateTime<Utc>,
        params: &Params
    ) -> Motion {
        let traj = match self.trajectory {
            Some(ref t) => t,
            None => return self.prev_raw_cmd
        };

        let st = &params.state_transition;
        let delay = params.delay_compensation_time_s;
        let vel = data.current_motion.vel_ms;

        let target_pose = pose.after_delay(delay, vel);
        let target_point = traj.interpolate(
            &target_pose,
            data.nearest_idx,
            st.emergency_state_traj_trans_dev_m,
            st.emergency_state_traj_rot_dev_rad
        );
        let target = keep_brake_before_stop(
            traj,
            Motion {
                vel_ms: target_point.longitudinal_velocity_ms,
                acc_mss: target_point.acceleration_mss
            },
            data.nearest_idx,
            params
        );

        let pred_vel = self.cmd_history.predict_velocity(
            vel, data.current_motion.acc_mss, now, delay);

        // Velocity feedback on the speed magnitude so that it works in either direction
        let pred_vel_abs = pred_vel.abs();
        let enable_integration =
            pred_vel_abs > params.drive.current_vel_threshold_pid_integration_ms;
        let vel_error = target.vel_ms.abs() - pred_vel_abs;
        let vel_error_filtered = self.lpf_vel_error.filter(vel_error);

        let (pid_acc, contrib) = self.pid.get(
            vel_error_filtered, data.dt_s, enable_integration, &params.drive);

        self.report.target_vel_ms = target.vel_ms;
        self.report.target_acc_mss = target.acc_mss;
        self.report.predicted_vel_ms = pred_vel;
        self.report.vel_error_ms = vel_error;
        self.report.vel_error_filtered_ms = vel_error_filtered;
        self.report.pid_acc_mss = pid_acc;
        self.report.pid_p_mss = contrib.p;
        self.report.pid_i_mss = contrib.i;
        self.report.pid_d_mss = contrib.d;

        Motion {
            vel_ms: target.vel_ms,
            acc_mss: target.acc_mss + pid_acc
        }
    }

    /// Ramp from the previous raw command towards the emergency setpoints.
    fn calc_emergency_cmd(&mut self, dt_s: f64, now: DateTime<Utc>, params: &Params) -> Motion {
        let p = &params.emergency;

        let cmd = Motion {
            vel_ms: apply_symmetric_diff_limit_filter(
                p.vel_ms, self.prev_raw_cmd.vel_ms, dt_s, p.acc_mss),
            acc_mss: apply_symmetric_diff_limit_filter(
                p.acc_mss, self.prev_raw_cmd.acc_mss, dt_s, p.jerk_msss)
        };

        if self.emergency_log_throttle.ready(now) {
            error!("Emergency stop, vel: {:.3} m/s, acc: {:.3} m/s^2", cmd.vel_ms, cmd.acc_mss);
        }

        cmd
    }

    /// Command used when the vehicle is too far from the trajectory to follow it.
    ///
    /// The state machine is bypassed and the emergency ramp is used directly.
    fn far_from_trajectory_cmd(
        &mut self,
        data: &ControlData,
        now: DateTime<Utc>,
        params: &Params
    ) -> Motion {
        if params.enable.large_tracking_error_emergency && self.state != ControlState::Emergency {
            info!("Control state changed from {} to {} (far from trajectory)",
                self.state, ControlState::Emergency);
            if self.state == ControlState::Stopping {
                self.smooth_stop = None;
            }
            self.state = ControlState::Emergency;
        }

        let raw_cmd = self.calc_emergency_cmd(data.dt_s, now, params);
        self.prev_raw_cmd = raw_cmd;
        self.cmd_history.clear();

        let acc = clamp(raw_cmd.acc_mss, params.limits.min_acc_mss, params.limits.max_acc_mss);
        self.report.acc_cmd_raw_mss = raw_cmd.acc_mss;
        self.report.acc_cmd_clamped_mss = acc;
        self.report.acc_cmd_slope_mss = acc;
        self.report.acc_cmd_jerk_mss = acc;

        Motion {
            vel_ms: raw_cmd.vel_ms,
            acc_mss: acc
        }
    }

    /// Shape the raw acceleration: clamp, slope compensation, then the jerk limit.
    fn calc_filtered_acc(
        &mut self,
        raw_acc_mss: f64,
        data: &ControlData,
        now: DateTime<Utc>,
        params: &Params
    ) -> f64 {
        let l = &params.limits;

        let acc_clamped = clamp(raw_acc_mss, l.min_acc_mss, l.max_acc_mss);

        // The history holds commands without slope compensation
        if self.state == ControlState::Drive {
            self.cmd_history.push(now, acc_clamped, params.delay_compensation_time_s);
        }
        else {
            self.cmd_history.clear();
        }

        let acc_slope = apply_slope_compensation(
            acc_clamped, data.slope_angle_rad, data.shift, params);

        let acc_jerk = apply_diff_limit_filter(
            acc_slope, self.prev_cmd.acc_mss, data.dt_s, l.max_jerk_msss, l.min_jerk_msss);

        self.report.acc_cmd_clamped_mss = acc_clamped;
        self.report.acc_cmd_slope_mss = acc_slope;
        self.report.acc_cmd_jerk_mss = acc_jerk;

        // Slope compensation can push the command outside the limits, the previous command is
        // always inside them so this cannot break the jerk limit
        clamp(acc_jerk, l.min_acc_mss, l.max_acc_mss)
    }

    /// Set the output and remember what was published.
    fn publish(&mut self, cmd: Motion, data: &ControlData, now: DateTime<Utc>) {
        self.vel_history.push(now, data.current_motion.vel_ms);
        self.prev_cmd = cmd;

        self.report.control_state = self.state;
        self.report.acc_cmd_published_mss = cmd.acc_mss;
        self.report.vel_cmd_published_ms = cmd.vel_ms;

        self.output = Some(LongitudinalCommand {
            stamp: now,
            speed_ms: cmd.vel_ms,
            acc_mss: cmd.acc_mss
        });
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Compensate the acceleration for gravity acting along the slope.
///
/// Pitch is negative uphill, so a vehicle driving forwards up a slope gets a larger command.
pub fn apply_slope_compensation(acc_mss: f64, pitch_rad: f64, shift: Shift, params: &Params) -> f64 {
    if !params.enable.slope_compensation {
        return acc_mss
    }

    let pitch = clamp(pitch_rad, params.slope.min_pitch_rad, params.slope.max_pitch_rad);

    acc_mss - shift.sign() * GRAVITY_MSS * pitch.sin()
}

/// Stop the target deceleration from easing off just before the stop point.
///
/// Inside the brake keeping region the target acceleration is capped at the larger of the
/// brake keeping acceleration and the strongest deceleration in the region.
pub fn keep_brake_before_stop(
    traj: &Trajectory,
    target: Motion,
    nearest_idx: usize,
    params: &Params
) -> Motion {
    if !params.enable.brake_keeping_before_stop {
        return target
    }

    let (region_start_idx, min_acc) = match traj.brake_keeping_region() {
        Some(r) => r,
        None => return target
    };

    let brake_keeping_acc = params.drive.brake_keeping_acc_mss.max(min_acc);

    let mut output = target;
    if nearest_idx >= region_start_idx && target.acc_mss > brake_keeping_acc {
        output.acc_mss = brake_keeping_acc;
    }

    output
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::long_ctrl::trajectory::test::straight_traj;
    use crate::sim_vehicle::{approach_trajectory, SimVehicle};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};
    use nalgebra::Vector3;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn pose_at(x: f64, y: f64) -> Pose {
        Pose::new(Vector3::new(x, y, 0.0), 0.0, 0.0, 0.0)
    }

    fn odom(ms: i64, speed_ms: f64) -> Odometry {
        Odometry { stamp: t(ms), speed_ms }
    }

    fn input(ms: i64, pose: Option<Pose>) -> InputData {
        InputData {
            now: t(ms),
            trajectory: None,
            odometry: None,
            pose,
            is_steer_converged: true
        }
    }

    /// Controller with a trajectory and two odometry samples at the given speed.
    fn ready_ctrl(params: Params, vels: &[f64], speed_ms: f64) -> LongCtrl {
        let mut ctrl = LongCtrl::new(params).unwrap();
        ctrl.set_trajectory(straight_traj(vels).points().to_vec()).unwrap();
        ctrl.set_odometry(odom(-100, speed_ms));
        ctrl.set_odometry(odom(-50, speed_ms));
        ctrl
    }

    #[test]
    fn test_no_output_before_inputs() {
        let mut ctrl = LongCtrl::new(Params::default()).unwrap();

        let (out, report) = ctrl.proc(&input(0, Some(pose_at(0.0, 0.0)))).unwrap();
        assert!(out.is_none());
        assert!(report.cycle_skipped);

        let mut i = input(30, Some(pose_at(0.0, 0.0)));
        i.trajectory = Some(straight_traj(&[1.0; 5]).points().to_vec());
        i.odometry = Some(odom(30, 0.0));
        assert!(ctrl.proc(&i).unwrap().0.is_none());

        // Second odometry sample but no pose
        let mut i = input(60, None);
        i.odometry = Some(odom(60, 0.0));
        assert!(ctrl.proc(&i).unwrap().0.is_none());

        let (out, report) = ctrl.proc(&input(90, Some(pose_at(0.0, 0.0)))).unwrap();
        assert!(out.is_some());
        assert!(!report.cycle_skipped);
    }

    #[test]
    fn test_far_from_trajectory_emergency() {
        let mut params = Params::default();
        params.enable.overshoot_emergency = false;
        params.enable.large_tracking_error_emergency = true;

        let mut ctrl = ready_ctrl(params, &[2.0; 10], 0.0);

        let (out, report) = ctrl.proc(&input(0, Some(pose_at(3.0, 10.0)))).unwrap();
        let out = out.unwrap();
        assert!(report.is_far_from_trajectory);
        assert_eq!(ctrl.control_state(), ControlState::Emergency);

        // Ramp from the previous raw command (zero) at the emergency jerk over one period
        assert_relative_eq!(out.acc_mss, -3.0 * 0.03, epsilon = 1e-9);
        assert_eq!(out.speed_ms, 0.0);

        let (out, _) = ctrl.proc(&input(30, Some(pose_at(3.0, 10.0)))).unwrap();
        assert_relative_eq!(out.unwrap().acc_mss, -3.0 * 0.06, epsilon = 1e-9);
    }

    #[test]
    fn test_far_from_trajectory_without_emergency_state() {
        let mut params = Params::default();
        params.enable.overshoot_emergency = false;
        params.enable.large_tracking_error_emergency = false;

        let mut ctrl = ready_ctrl(params, &[2.0; 10], 0.0);
        ctrl.cmd_history.push(t(-30), 0.5, 0.17);

        let (out, report) = ctrl.proc(&input(0, Some(pose_at(3.0, 10.0)))).unwrap();
        let out = out.unwrap();
        assert!(report.is_far_from_trajectory);
        assert_eq!(ctrl.control_state(), ControlState::Stopped);
        assert_eq!(report.control_state, ControlState::Stopped);
        assert!(ctrl.cmd_history.is_empty());

        // Same ramp as with the emergency state enabled
        assert_relative_eq!(out.acc_mss, -3.0 * 0.03, epsilon = 1e-9);
        assert_eq!(out.speed_ms, 0.0);

        let (out, _) = ctrl.proc(&input(30, Some(pose_at(3.0, 10.0)))).unwrap();
        assert_relative_eq!(out.unwrap().acc_mss, -3.0 * 0.06, epsilon = 1e-9);
        assert_eq!(ctrl.control_state(), ControlState::Stopped);
    }

    #[test]
    fn test_get_dt_clamped() {
        let params = Params::default();
        let mut ctrl = LongCtrl::new(params.clone()).unwrap();

        // First cycle uses the nominal period
        assert_relative_eq!(ctrl.get_dt(t(0), &params), 0.03);

        // Tiny and huge gaps
        assert_relative_eq!(ctrl.get_dt(t(1), &params), 0.015);
        assert_relative_eq!(ctrl.get_dt(t(5001), &params), 0.06);

        // Clock stepping backwards
        assert_relative_eq!(ctrl.get_dt(t(4000), &params), 0.015);
    }

    #[test]
    fn test_departure_from_stopped_resets() {
        let params = Params::default();
        let mut ctrl = ready_ctrl(params.clone(), &[2.0; 20], 1.0);
        assert_eq!(ctrl.control_state(), ControlState::Stopped);

        // State left over from before the stop
        ctrl.pid.get(1.0, 1.0, true, &params.drive);
        assert!(ctrl.pid.integral() > 0.5);
        ctrl.lpf_vel_error.reset(0.5);
        ctrl.prev_cmd = Motion { vel_ms: 0.0, acc_mss: -1.0 };

        // Stop point 18 m ahead
        let (out, report) = ctrl.proc(&input(0, Some(pose_at(1.0, 0.0)))).unwrap();
        let out = out.unwrap();
        assert_eq!(ctrl.control_state(), ControlState::Drive);

        // Velocity error of 1 m/s through a filter starting from zero
        assert_relative_eq!(report.vel_error_ms, 1.0, epsilon = 1e-9);
        assert_relative_eq!(report.vel_error_filtered_ms, 0.1, epsilon = 1e-9);
        assert_relative_eq!(
            ctrl.pid.integral(), report.vel_error_filtered_ms * 0.03, epsilon = 1e-9);

        // Ramps up from zero rather than from the braking command
        assert_relative_eq!(out.acc_mss, params.limits.max_jerk_msss * 0.03, epsilon = 1e-9);
    }

    #[test]
    fn test_stopped_jerk_step() {
        let mut params = Params::default();
        params.ctrl_period_s = 0.1;
        params.stopped.acc_mss = -1.0;
        params.stopped.jerk_msss = 0.5;

        // Stop point at the vehicle
        let mut ctrl = ready_ctrl(params, &[0.0; 5], 0.0);
        assert_eq!(ctrl.control_state(), ControlState::Stopped);

        let (out, _) = ctrl.proc(&input(0, Some(pose_at(0.0, 0.0)))).unwrap();
        let out = out.unwrap();

        assert_eq!(ctrl.control_state(), ControlState::Stopped);
        assert_relative_eq!(out.acc_mss, -0.05, epsilon = 1e-9);
        assert_eq!(out.speed_ms, 0.0);
    }

    #[test]
    fn test_slope_compensation() {
        let mut params = Params::default();
        params.enable.slope_compensation = true;

        let expected = -GRAVITY_MSS * 0.1f64.sin();
        assert_relative_eq!(
            apply_slope_compensation(0.0, 0.1, Shift::Forward, &params), expected);
        assert_relative_eq!(
            apply_slope_compensation(0.0, 0.1, Shift::Reverse, &params), -expected);
        assert_eq!(apply_slope_compensation(0.3, 0.1, Shift::Neutral, &params), 0.3);

        // Pitch is limited
        assert_relative_eq!(
            apply_slope_compensation(0.0, 0.5, Shift::Forward, &params), expected);

        params.enable.slope_compensation = false;
        assert_eq!(apply_slope_compensation(0.3, 0.1, Shift::Forward, &params), 0.3);
    }

    #[test]
    fn test_slope_compensation_in_cycle() {
        let mut params = Params::default();
        params.enable.slope_compensation = true;
        params.slope.lpf_pitch_gain = 0.0;
        params.stopped.acc_mss = 0.0;
        params.limits.min_jerk_msss = -100.0;

        let mut ctrl = ready_ctrl(params, &[0.0; 5], 0.0);

        let pose = Pose::new(Vector3::zeros(), 0.0, 0.1, 0.0);
        let (out, report) = ctrl.proc(&input(0, Some(pose))).unwrap();

        let expected = -GRAVITY_MSS * 0.1f64.sin();
        assert_relative_eq!(report.slope_angle_rad, 0.1, epsilon = 1e-9);
        assert_relative_eq!(report.acc_cmd_slope_mss, expected, epsilon = 1e-9);
        assert_relative_eq!(out.unwrap().acc_mss, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_trajectory_retained() {
        let mut ctrl = ready_ctrl(Params::default(), &[1.0; 5], 0.0);
        let before = ctrl.trajectory().cloned();

        let mut i = input(0, Some(pose_at(0.0, 0.0)));
        i.trajectory = Some(vec![TrajectoryPoint::default()]);
        let (out, _) = ctrl.proc(&i).unwrap();

        assert!(out.is_some());
        assert_eq!(ctrl.trajectory().cloned(), before);
    }

    #[test]
    fn test_shift_change_resets_pid() {
        let mut ctrl = ready_ctrl(Params::default(), &[2.0; 20], 1.0);
        ctrl.state = ControlState::Drive;

        for i in 0..20 {
            let mut inp = input(i * 30, Some(pose_at(1.0, 0.0)));
            inp.odometry = Some(odom(i * 30, 1.0));
            ctrl.proc(&inp).unwrap();
        }
        assert!(ctrl.pid.integral() > 0.1);

        let mut inp = input(600, Some(pose_at(1.0, 0.0)));
        inp.trajectory = Some(straight_traj(&[-2.0; 20]).points().to_vec());
        inp.odometry = Some(odom(600, 1.0));
        let (_, report) = ctrl.proc(&inp).unwrap();

        assert_eq!(report.shift, Shift::Reverse);
        assert_relative_eq!(
            ctrl.pid.integral(), report.vel_error_filtered_ms * 0.03, epsilon = 1e-9);
    }

    #[test]
    fn test_params_update_next_cycle() {
        let mut ctrl = ready_ctrl(Params::default(), &[0.0; 5], 0.0);
        let handle = ctrl.params_handle();

        ctrl.proc(&input(0, Some(pose_at(0.0, 0.0)))).unwrap();

        handle.update_with(|p| {
            p.stopped.acc_mss = 0.5;
            p.stopped.jerk_msss = 100.0;
            p.limits.max_jerk_msss = 100.0;
        }).unwrap();

        let (out, _) = ctrl.proc(&input(30, Some(pose_at(0.0, 0.0)))).unwrap();
        assert_relative_eq!(out.unwrap().acc_mss, 0.5, epsilon = 1e-9);

        // Invalid updates are rejected
        assert!(handle.update_with(|p| p.ctrl_period_s = 0.0).is_err());
        assert_eq!(ctrl.params_handle().snapshot().stopped.acc_mss, 0.5);
    }

    #[test]
    fn test_brake_keeping() {
        let mut params = Params::default();
        params.enable.brake_keeping_before_stop = true;

        let mut points = straight_traj(&[3.0, 3.0, 2.0, 1.0, 0.0, 0.0]).points().to_vec();
        let accs = [0.0, -0.5, -1.0, -0.8, -0.1, 0.0];
        for (p, a) in points.iter_mut().zip(accs.iter()) {
            p.acceleration_mss = *a;
        }
        let traj = Trajectory::new(points).unwrap();

        // Region starts at index 2, floor is max(-0.2, -1.0)
        let target = Motion { vel_ms: 0.5, acc_mss: -0.1 };
        assert_relative_eq!(keep_brake_before_stop(&traj, target, 3, &params).acc_mss, -0.2);
        assert_relative_eq!(keep_brake_before_stop(&traj, target, 1, &params).acc_mss, -0.1);

        // Stronger decelerations are untouched
        let target = Motion { vel_ms: 0.5, acc_mss: -0.6 };
        assert_relative_eq!(keep_brake_before_stop(&traj, target, 3, &params).acc_mss, -0.6);
    }

    /// Drive up to a stop line against the simulated vehicle and check the output bounds.
    #[test]
    fn test_closed_loop_bounds() {
        let params = Params::default();
        let l = params.limits.clone();
        let period = params.ctrl_period_s;
        let period_ms = (period * 1000.0).round() as i64;

        let mut ctrl = LongCtrl::new(params.clone()).unwrap();
        let mut vehicle = SimVehicle::new(pose_at(0.0, 0.0), 0.2, 0.1);

        let mut traj = Some(approach_trajectory(30.0, 3.0, 0.5, 0.5));
        let mut prev_state = ctrl.control_state();
        let mut prev_acc = 0.0;
        let mut seen_states = vec![];

        for i in 0..(40_000 / period_ms) {
            let now = t(i * period_ms);
            let inp = InputData {
                now,
                trajectory: traj.take(),
                odometry: Some(Odometry { stamp: now, speed_ms: vehicle.speed_ms() }),
                pose: Some(vehicle.pose()),
                is_steer_converged: true
            };

            let (out, report) = ctrl.proc(&inp).unwrap();

            if let Some(cmd) = out {
                assert!(cmd.acc_mss <= l.max_acc_mss + 1e-9);
                assert!(cmd.acc_mss >= l.min_acc_mss - 1e-9);

                let state = report.control_state;
                if !prev_state.is_departure(state) {
                    let jerk = (cmd.acc_mss - prev_acc) / report.dt_s;
                    assert!(jerk <= l.max_jerk_msss + 1e-6, "jerk {} at cycle {}", jerk, i);
                    assert!(jerk >= l.min_jerk_msss - 1e-6, "jerk {} at cycle {}", jerk, i);
                }

                if seen_states.last() != Some(&state) {
                    seen_states.push(state);
                }

                prev_state = state;
                prev_acc = cmd.acc_mss;
                vehicle.step(&cmd, period);
            }
        }

        assert!(!seen_states.contains(&ControlState::Emergency));
        assert!(seen_states.contains(&ControlState::Drive));
        assert!(seen_states.contains(&ControlState::Stopping));
        assert_eq!(ctrl.control_state(), ControlState::Stopped);
    }
}
