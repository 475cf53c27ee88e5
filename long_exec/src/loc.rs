//! # Localisation types
//!
//! Pose and odometry are produced by external localisation and are only consumed here.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use nalgebra::{Vector2, Vector3, UnitQuaternion};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The current pose (position and attitude in the map frame) of the vehicle.
///
/// Pitch follows the right handed convention about the body Y (left) axis, so a vehicle
/// pointing uphill has a negative pitch.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pose {

    /// The position in the map frame
    pub position_m: Vector3<f64>,

    /// The attitude of the vehicle in the map frame.
    pub attitude_q: UnitQuaternion<f64>
}

/// A single odometry velocity sample.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct Odometry {
    /// Time at which the sample was measured
    pub stamp: DateTime<Utc>,

    /// Longitudinal speed of the vehicle, negative when reversing.
    ///
    /// Units: meters/second
    pub speed_ms: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for Pose {
    fn default() -> Self {
        Self {
            position_m: Vector3::zeros(),
            attitude_q: UnitQuaternion::identity()
        }
    }
}

impl Pose {

    /// Create a pose from a position and the three euler angles.
    pub fn new(position_m: Vector3<f64>, roll_rad: f64, pitch_rad: f64, heading_rad: f64) -> Self {
        Self {
            position_m,
            attitude_q: UnitQuaternion::from_euler_angles(roll_rad, pitch_rad, heading_rad)
        }
    }

    /// Return the heading (yaw, angle to the positive X axis) of the vehicle in radians.
    ///
    /// Heading is given in the range [-pi, pi], with 0 being in the X direction.
    pub fn get_heading(&self) -> f64 {
        self.attitude_q.euler_angles().2
    }

    /// Return the pitch of the vehicle in radians.
    pub fn get_pitch(&self) -> f64 {
        self.attitude_q.euler_angles().1
    }

    /// Return the 2D position of the vehicle
    pub fn position2(&self) -> Vector2<f64> {
        Vector2::new(self.position_m[0], self.position_m[1])
    }

    /// Unit vector pointing along the heading of the vehicle, in 2D.
    pub fn forward2(&self) -> Vector2<f64> {
        let heading = self.get_heading();
        Vector2::new(heading.cos(), heading.sin())
    }

    /// The pose the vehicle will reach after travelling at `speed_ms` for `delay_s` along its
    /// current heading.
    pub fn after_delay(&self, delay_s: f64, speed_ms: f64) -> Self {
        let running_dist_m = delay_s * speed_ms;
        let forward = self.forward2();

        let mut pose = *self;
        pose.position_m[0] += running_dist_m * forward[0];
        pose.position_m[1] += running_dist_m * forward[1];

        pose
    }
}
