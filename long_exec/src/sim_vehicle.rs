//! # Simulated vehicle
//!
//! A minimal longitudinal plant for exercising the controller without hardware. The commanded
//! acceleration reaches the vehicle after a dead time and is then followed with a first order
//! lag. The vehicle moves along its heading and never reverses through zero speed on its own,
//! a stopped vehicle only changes direction when the command asks it to.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use nalgebra::Vector3;
use std::collections::VecDeque;

// Internal
use crate::loc::Pose;
use crate::long_ctrl::{LongitudinalCommand, TrajectoryPoint};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Simulated vehicle state.
#[derive(Debug, Clone)]
pub struct SimVehicle {
    pose: Pose,

    /// Signed speed (m/s)
    speed_ms: f64,

    /// Actual acceleration along the direction of travel (m/s^2)
    acc_mss: f64,

    /// +1 forwards, -1 reverse
    direction: f64,

    /// Lag time constant (s)
    time_constant_s: f64,

    /// Time for a command to reach the vehicle (s)
    dead_time_s: f64,

    /// Commands which haven't reached the vehicle yet, with the time they arrive
    in_flight: VecDeque<(f64, f64)>,

    /// Acceleration command currently acting on the vehicle
    active_acc_cmd_mss: f64,

    /// Simulation time (s)
    time_s: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SimVehicle {
    pub fn new(pose: Pose, time_constant_s: f64, dead_time_s: f64) -> Self {
        Self {
            pose,
            speed_ms: 0.0,
            acc_mss: 0.0,
            direction: 1.0,
            time_constant_s: time_constant_s.max(0.0),
            dead_time_s: dead_time_s.max(0.0),
            in_flight: VecDeque::new(),
            active_acc_cmd_mss: 0.0,
            time_s: 0.0
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn speed_ms(&self) -> f64 {
        self.speed_ms
    }

    pub fn acc_mss(&self) -> f64 {
        self.acc_mss
    }

    /// Apply a command and advance the simulation by `dt_s`.
    pub fn step(&mut self, cmd: &LongitudinalCommand, dt_s: f64) {
        if dt_s <= 0.0 {
            return;
        }

        self.in_flight.push_back((self.time_s + self.dead_time_s, cmd.acc_mss));
        while let Some(&(arrival_s, acc)) = self.in_flight.front() {
            if arrival_s > self.time_s {
                break;
            }
            self.active_acc_cmd_mss = acc;
            self.in_flight.pop_front();
        }

        // Implicit Euler step of the lag, stable for any dt
        self.acc_mss += (self.active_acc_cmd_mss - self.acc_mss)
            * dt_s / (self.time_constant_s + dt_s);

        if self.speed_ms == 0.0 {
            if cmd.speed_ms > 0.0 {
                self.direction = 1.0;
            }
            else if cmd.speed_ms < 0.0 {
                self.direction = -1.0;
            }
        }

        let speed_abs = (self.speed_ms.abs() + self.acc_mss * dt_s).max(0.0);
        if speed_abs == 0.0 {
            // Brakes can hold a stopped vehicle but not push it backwards
            self.acc_mss = self.acc_mss.max(0.0);
        }

        let mean_speed = 0.5 * (self.speed_ms + self.direction * speed_abs);
        self.pose = self.pose.after_delay(dt_s, mean_speed);
        self.speed_ms = self.direction * speed_abs;
        self.time_s += dt_s;
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// A straight trajectory along X approaching a stop line.
///
/// The target velocity is `cruise_ms` until the vehicle needs to start braking at `decel_mss`
/// to stop at `stop_m`, and zero from the stop line to 5 m beyond it.
pub fn approach_trajectory(
    stop_m: f64,
    cruise_ms: f64,
    decel_mss: f64,
    spacing_m: f64
) -> Vec<TrajectoryPoint> {
    let num_points = ((stop_m + 5.0) / spacing_m).ceil() as usize + 1;

    (0..num_points)
        .map(|i| {
            let s = i as f64 * spacing_m;
            let braking_vel = (2.0 * decel_mss * (stop_m - s).max(0.0)).sqrt();

            let (vel, acc) = if s >= stop_m {
                (0.0, 0.0)
            }
            else if braking_vel < cruise_ms {
                (braking_vel, -decel_mss)
            }
            else {
                (cruise_ms, 0.0)
            };

            TrajectoryPoint {
                pose: Pose::new(Vector3::new(s, 0.0, 0.0), 0.0, 0.0, 0.0),
                longitudinal_velocity_ms: vel,
                acceleration_mss: acc
            }
        })
        .collect()
}
