//! # Longitudinal control module
//!
//! Longitudinal control computes, once per control cycle, the speed and acceleration command
//! which keeps the vehicle on the velocity profile of the planned trajectory.
//!
//! Each cycle the controller:
//!
//!  1. Measures the current motion of the vehicle from odometry and finds where it is on the
//!     trajectory, including the signed distance to the next stop point.
//!  1. Updates the control state (`Drive`, `Stopping`, `Stopped` or `Emergency`).
//!  1. Generates a raw command for that state. In `Drive` the target is taken from the point
//!     the vehicle will reach once the actuation delay has passed, and a PID acting on the
//!     predicted velocity corrects it. In `Stopping` the smooth stop profile is used, and in
//!     `Stopped` and `Emergency` the command ramps towards fixed setpoints.
//!  1. Shapes the acceleration: clamped to the limits, compensated for the road slope, then
//!     limited in jerk.
//!
//! If the vehicle is too far from the trajectory the state machine is bypassed and the
//! emergency ramp is commanded directly.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod cmd_history;
pub mod control_data;
pub mod control_state;
pub mod filters;
pub mod params;
pub mod pid;
pub mod smooth_stop;
pub mod state;
pub mod trajectory;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// Internal
pub use cmd_history::*;
pub use control_data::*;
pub use control_state::*;
pub use filters::*;
pub use params::{Params, ParamsError, ParamsHandle};
pub use pid::*;
pub use smooth_stop::*;
pub use state::*;
pub use trajectory::*;
