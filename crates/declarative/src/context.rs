//! Progress reporting
//!
//! The apply processor reports every unit state transition through a
//! [`ProgressSink`], so callers can record status without the engine
//! depending on any particular store or UI.

use crate::types::UnitResult;

/// Receives unit state transitions during processing
pub trait ProgressSink: Send {
    /// Called with the unit's result after its state changed
    ///
    /// `result.state` is the new state. Implementations must not panic;
    /// failures to record progress should be logged and swallowed.
    fn on_unit_state(&mut self, result: &UnitResult);
}

/// No-op progress sink
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_unit_state(&mut self, _result: &UnitResult) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(&UnitResult) + Send,
{
    fn on_unit_state(&mut self, result: &UnitResult) {
        self(result);
    }
}
