//! # Velocity PID controller
//!
//! Feedback controller acting on the (filtered) velocity error in the drive state. Gains and
//! limits are passed in on every call so that parameter updates take effect on the next cycle
//! without resetting the controller.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::Serialize;

use super::params::DriveParams;
use util::maths::clamp;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A PID controller with per-term and output saturation.
#[derive(Debug, Clone, Default)]
pub struct PidController {
    /// Accumulated error integral
    integral: f64,

    /// Error from the previous call, `None` after a reset
    prev_error: Option<f64>
}

/// The contribution of each term to the last output of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidContributions {
    pub p: f64,
    pub i: f64,
    pub d: f64
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PidController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the output of the controller for the given error.
    ///
    /// The integral only accumulates when `enable_integration` is set, and is itself bounded so
    /// that the integral term cannot grow past its limits. There is no derivative term on the
    /// first call after a reset.
    pub fn get(
        &mut self,
        error: f64,
        dt_s: f64,
        enable_integration: bool,
        params: &DriveParams
    ) -> (f64, PidContributions) {
        let p = clamp(
            params.k_p * error,
            params.min_p_effort_mss,
            params.max_p_effort_mss
        );

        if enable_integration {
            self.integral += error * dt_s;
        }
        if params.k_i.abs() > f64::EPSILON {
            let a = params.min_i_effort_mss / params.k_i;
            let b = params.max_i_effort_mss / params.k_i;
            self.integral = clamp(self.integral, a.min(b), a.max(b));
        }
        let i = clamp(
            params.k_i * self.integral,
            params.min_i_effort_mss,
            params.max_i_effort_mss
        );

        let d = match self.prev_error {
            Some(e) if dt_s > 0.0 => clamp(
                params.k_d * (error - e) / dt_s,
                params.min_d_effort_mss,
                params.max_d_effort_mss
            ),
            _ => 0.0
        };

        self.prev_error = Some(error);

        let out = clamp(p + i + d, params.min_out_mss, params.max_out_mss);

        (out, PidContributions { p, i, d })
    }

    /// Clear the integral and the previous error.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::long_ctrl::params::Params;
    use approx::assert_relative_eq;

    #[test]
    fn test_pid_terms() {
        let params = Params::default().drive;
        let mut pid = PidController::new();

        let (out, c) = pid.get(0.5, 0.1, true, &params);
        assert_relative_eq!(c.p, 0.5);
        assert_relative_eq!(c.i, 0.005, epsilon = 1e-12);
        assert_eq!(c.d, 0.0);
        assert_relative_eq!(out, 0.505, epsilon = 1e-12);

        // No integration
        let (_, c) = pid.get(0.5, 0.1, false, &params);
        assert_relative_eq!(c.i, 0.005, epsilon = 1e-12);
        assert_relative_eq!(pid.integral(), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_pid_windup() {
        let params = Params::default().drive;
        let mut pid = PidController::new();

        for _ in 0..1000 {
            pid.get(2.0, 0.1, true, &params);
        }

        // Integral is held at the effort limit
        assert_relative_eq!(pid.integral(), 3.0, epsilon = 1e-9);
        let (out, c) = pid.get(2.0, 0.1, true, &params);
        assert_relative_eq!(c.i, 0.3, epsilon = 1e-9);
        assert_relative_eq!(c.p, 1.0);
        assert_relative_eq!(out, 1.0);

        // So a sign change in the error acts immediately
        let (out, _) = pid.get(-0.5, 0.1, true, &params);
        assert_relative_eq!(out, -0.205, epsilon = 1e-9);
    }

    #[test]
    fn test_pid_derivative_and_reset() {
        let mut params = Params::default().drive;
        params.k_d = 1.0;
        params.max_d_effort_mss = 5.0;
        params.min_d_effort_mss = -5.0;
        params.max_out_mss = 10.0;
        params.min_out_mss = -10.0;

        let mut pid = PidController::new();
        let (_, c) = pid.get(1.0, 0.1, false, &params);
        assert_eq!(c.d, 0.0);

        let (_, c) = pid.get(1.2, 0.1, false, &params);
        assert_relative_eq!(c.d, 2.0, epsilon = 1e-9);

        let (_, c) = pid.get(2.2, 0.1, false, &params);
        assert_relative_eq!(c.d, 5.0);

        pid.get(2.0, 0.1, true, &params);
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        let (_, c) = pid.get(-3.0, 0.1, false, &params);
        assert_eq!(c.d, 0.0);
    }
}
