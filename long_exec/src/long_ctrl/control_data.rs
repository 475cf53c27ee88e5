//! # Control data
//!
//! The per-cycle snapshot of everything the state machine and the command generators need to
//! know about the vehicle and its relation to the trajectory.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Target velocities within this of zero do not change the shift.
///
/// Units: meters/second
const SHIFT_VEL_EPSILON_MS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Longitudinal motion of the vehicle, or a motion target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Motion {
    /// Units: meters/second
    pub vel_ms: f64,

    /// Units: meters/second^2
    pub acc_mss: f64
}

/// Snapshot of the control inputs for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlData {
    /// Clamped time since the last cycle.
    ///
    /// Units: seconds
    pub dt_s: f64,

    /// Measured motion, acceleration is filtered
    pub current_motion: Motion,

    /// Index of the trajectory point nearest the vehicle
    pub nearest_idx: usize,

    /// Direction of travel implied by the trajectory
    pub shift: Shift,

    /// Signed distance to the stop point, negative once passed.
    ///
    /// Units: meters
    pub stop_dist_m: f64,

    /// Pitch used for slope compensation.
    ///
    /// Units: radians
    pub slope_angle_rad: f64,

    /// True if no trajectory point is within the deviation limits of the pose
    pub is_far_from_trajectory: bool
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Shift {
    Forward,
    Reverse,
    Neutral
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Shift {
    /// Determine the shift from the target velocity, keeping `prev` if the target is zero.
    pub fn from_target_vel(target_vel_ms: f64, prev: Shift) -> Self {
        if target_vel_ms > SHIFT_VEL_EPSILON_MS {
            Shift::Forward
        }
        else if target_vel_ms < -SHIFT_VEL_EPSILON_MS {
            Shift::Reverse
        }
        else {
            prev
        }
    }

    /// Sign applied to accelerations acting along the direction of travel.
    pub fn sign(&self) -> f64 {
        match self {
            Shift::Forward => 1.0,
            Shift::Reverse => -1.0,
            Shift::Neutral => 0.0
        }
    }
}

impl Default for Shift {
    fn default() -> Self {
        Shift::Forward
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shift() {
        assert_eq!(Shift::from_target_vel(1.0, Shift::Reverse), Shift::Forward);
        assert_eq!(Shift::from_target_vel(-0.5, Shift::Forward), Shift::Reverse);
        assert_eq!(Shift::from_target_vel(1e-6, Shift::Reverse), Shift::Reverse);
        assert_eq!(Shift::from_target_vel(0.0, Shift::Neutral), Shift::Neutral);

        assert_eq!(Shift::Reverse.sign(), -1.0);
        assert_eq!(Shift::Neutral.sign(), 0.0);
    }
}
