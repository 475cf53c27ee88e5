//! Host platform utility functions

use std::path::PathBuf;

/// Name of the environment variable pointing at the software root directory.
pub const SW_ROOT_ENV_VAR: &str = "LONG_CTRL_SW_ROOT";

/// Get the software root directory from the environment.
///
/// Parameter files are found under `<root>/params` and sessions are created under
/// `<root>/<sessions dir>`.
pub fn get_sw_root() -> Result<PathBuf, std::env::VarError> {
    std::env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}
