//! Longitudinal control executable entry point.
//!
//! # Architecture
//!
//! The controller is run in closed loop against a simulated vehicle, in simulated time:
//!
//!     - Initialise the session, logging and LongCtrl
//!     - Load the trajectory, either from the JSON file given as the only argument or a default
//!       straight approach to a stop line
//!     - Main loop, one iteration per control period:
//!         - Reload the parameters if the parameter file has changed
//!         - LongCtrl processing, with the pose and speed of the simulated vehicle
//!         - Archive LongCtrl
//!         - Step the simulated vehicle with the command
//!     - Exit once the vehicle has been stopped for a while or the time limit is reached

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use chrono::Utc;
use color_eyre::{Report, eyre::{WrapErr, eyre}};
use log::{debug, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

// Internal
use long_lib::{
    loc::Odometry,
    long_ctrl::{
        ControlState, InputData, LongCtrl, LongitudinalCommand, Params, ParamsHandle,
        TrajectoryPoint
    },
    sim_vehicle::{approach_trajectory, SimVehicle}
};
use util::{
    archive::Archived,
    logger::{logger_init, LevelFilter},
    module::State,
    params,
    session::Session,
    time::seconds_to_duration
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Parameter file for LongCtrl, relative to the params directory.
const PARAMS_FILE: &str = "long_ctrl.toml";

/// How often the parameter file is checked for changes.
const PARAMS_POLL_PERIOD_S: f64 = 1.0;

/// Time the vehicle must spend in the stopped state before the run is complete.
const STOPPED_EXIT_TIME_S: f64 = 2.0;

/// Longest simulated run.
const MAX_SIM_TIME_S: f64 = 120.0;

/// Default trajectory stop line position
const DEFAULT_STOP_LINE_M: f64 = 40.0;

/// Default trajectory cruise speed
const DEFAULT_CRUISE_MS: f64 = 3.0;

/// Default trajectory braking deceleration
const DEFAULT_DECEL_MSS: f64 = 0.5;

/// Default trajectory point spacing
const DEFAULT_SPACING_M: f64 = 0.5;

/// Simulated vehicle lag time constant
const SIM_TIME_CONSTANT_S: f64 = 0.2;

/// Simulated vehicle dead time
const SIM_DEAD_TIME_S: f64 = 0.1;

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    let session = Session::new(
        "long_exec",
        "sessions"
    ).wrap_err("Failed to create the session")?;

    logger_init(LevelFilter::Debug, &session)
        .wrap_err("Failed to initialise logging")?;

    info!("Longitudinal Control Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD TRAJECTORY ----

    let args: Vec<String> = env::args().collect();
    debug!("CLI arguments: {:?}", args);

    let points: Vec<TrajectoryPoint> = match args.len() {
        1 => {
            info!(
                "No trajectory provided, using a {:.1} m approach to a stop line",
                DEFAULT_STOP_LINE_M
            );
            approach_trajectory(
                DEFAULT_STOP_LINE_M, DEFAULT_CRUISE_MS, DEFAULT_DECEL_MSS, DEFAULT_SPACING_M)
        },
        2 => {
            info!("Loading trajectory from \"{}\"", &args[1]);
            let traj_str = fs::read_to_string(&args[1])
                .wrap_err("Failed to read the trajectory file")?;
            serde_json::from_str(&traj_str)
                .wrap_err("Failed to parse the trajectory file")?
        },
        n => return Err(eyre!("Expected either zero or one argument, found {}", n - 1))
    };

    info!("Trajectory contains {} points\n", points.len());

    // ---- INITIALISE MODULES ----

    let mut long_ctrl = LongCtrl::default();
    long_ctrl.init(PARAMS_FILE, &session)
        .wrap_err("Failed to initialise LongCtrl")?;
    info!("LongCtrl init complete");

    let params_handle = long_ctrl.params_handle();
    let params_path = params::params_path(PARAMS_FILE)
        .wrap_err("Failed to find the LongCtrl parameter file")?;
    let mut params_mtime = file_mtime(&params_path);

    let start_pose = points.first().map(|p| p.pose).unwrap_or_default();
    let mut vehicle = SimVehicle::new(start_pose, SIM_TIME_CONSTANT_S, SIM_DEAD_TIME_S);

    // ---- MAIN LOOP ----

    info!("Beginning main loop\n");

    let epoch = Utc::now();
    let mut sim_time_s = 0.0;
    let mut last_poll_s = 0.0;
    let mut stopped_since_s: Option<f64> = None;
    let mut pending_traj = Some(points);
    let mut num_cycles: u64 = 0;

    loop {
        let period_s = params_handle.snapshot().ctrl_period_s;
        let now = epoch + seconds_to_duration(sim_time_s);

        if sim_time_s - last_poll_s >= PARAMS_POLL_PERIOD_S {
            last_poll_s = sim_time_s;
            reload_params(&params_path, &params_handle, &mut params_mtime);
        }

        let input = InputData {
            now,
            trajectory: pending_traj.take(),
            odometry: Some(Odometry {
                stamp: now,
                speed_ms: vehicle.speed_ms()
            }),
            pose: Some(vehicle.pose()),
            is_steer_converged: true
        };

        let (output, report) = long_ctrl.proc(&input)
            .wrap_err("Error during LongCtrl processing")?;
        long_ctrl.write()
            .wrap_err("Failed to archive LongCtrl")?;

        // Skipped cycles leave the vehicle coasting
        let cmd = output.unwrap_or(LongitudinalCommand {
            stamp: now,
            speed_ms: vehicle.speed_ms(),
            acc_mss: 0.0
        });
        vehicle.step(&cmd, period_s);

        num_cycles += 1;
        sim_time_s += period_s;

        if report.control_state == ControlState::Stopped && !report.cycle_skipped {
            let since = *stopped_since_s.get_or_insert(sim_time_s);
            if sim_time_s - since >= STOPPED_EXIT_TIME_S {
                info!("Vehicle stopped, ending run");
                break;
            }
        }
        else {
            stopped_since_s = None;
        }

        if sim_time_s >= MAX_SIM_TIME_S {
            warn!("Time limit of {:.0} s reached before the vehicle stopped", MAX_SIM_TIME_S);
            break;
        }
    }

    info!(
        "Run complete after {} cycles ({:.2} s), final position {:.3} m, speed {:.3} m/s",
        num_cycles,
        sim_time_s,
        vehicle.pose().position_m[0],
        vehicle.speed_ms()
    );

    Ok(())
}

/// Modification time of a file, `None` if it can't be read.
fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Reload the parameters if the file has been modified since the last check.
///
/// A file which can't be parsed or fails validation is ignored and the current parameters stay
/// active.
fn reload_params(path: &Path, handle: &ParamsHandle, last_mtime: &mut Option<SystemTime>) {
    let mtime = file_mtime(path);
    if mtime.is_none() || mtime == *last_mtime {
        return;
    }
    *last_mtime = mtime;

    match params::load_from_path::<Params, _>(path) {
        Ok(p) => match handle.update(p) {
            Ok(()) => info!("Reloaded LongCtrl parameters from {:?}", path),
            Err(e) => warn!("Rejected reloaded LongCtrl parameters: {}", e)
        },
        Err(e) => warn!("Could not reload LongCtrl parameters: {}", e)
    }
}
