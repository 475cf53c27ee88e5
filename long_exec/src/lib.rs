//! # Longitudinal control library.
//!
//! This library allows other crates in the workspace (and the benches) to access items defined
//! inside the longitudinal control crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Localisation types - the vehicle pose and odometry samples consumed by control
pub mod loc;

/// Longitudinal control module - computes the speed and acceleration command each cycle
pub mod long_ctrl;

/// Simulated vehicle - a simple longitudinal plant used to exercise the controller
pub mod sim_vehicle;
