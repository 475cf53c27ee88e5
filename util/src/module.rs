//! Cyclic module interface
//!
//! A cyclic module is initialised once from its parameter file and then stepped once per control
//! period. Each step consumes the latest inputs and yields the output to publish together with a
//! status report describing how it was produced.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use crate::session::Session;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// State carried by a cyclic module between control periods.
pub trait State {
    /// Passed to `init`, usually the parameter file to load
    type InitData;
    type InitError;

    /// Inputs sampled at the start of a period
    type InputData;
    /// What the module publishes for the period
    type OutputData;
    /// Diagnostics for the period, archived alongside the output
    type StatusReport;
    type ProcError;

    /// Load parameters and open any archives in the session directory.
    ///
    /// Must be called before the first `proc`.
    fn init(&mut self, init_data: Self::InitData, session: &Session)
        -> Result<(), Self::InitError>;

    /// Run one control period.
    ///
    /// A period which can't produce an output yet (missing inputs, for example) is not an error,
    /// modules report it through `OutputData` and `StatusReport` instead.
    fn proc(&mut self, input_data: &Self::InputData)
        -> Result<(Self::OutputData, Self::StatusReport), Self::ProcError>;
}
