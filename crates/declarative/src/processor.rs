//! Provider contracts for processing units
//!
//! The engine never tests or applies anything itself. A
//! [`SetProcessorFactory`] hands out one [`SetProcessor`] per set, which in
//! turn creates a [`UnitProcessor`] for each unit it is asked about.
//!
//! # Example
//!
//! ```ignore
//! use declarative::{ApplySettingsOutcome, UnitProcessor, ValueSet};
//!
//! struct EnvVar { name: String, value: String }
//!
//! impl UnitProcessor for EnvVar {
//!     fn test_settings(&mut self) -> anyhow::Result<bool> {
//!         Ok(std::env::var(&self.name).ok().as_deref() == Some(self.value.as_str()))
//!     }
//!
//!     fn get_settings(&mut self) -> anyhow::Result<ValueSet> {
//!         let mut values = ValueSet::new();
//!         if let Ok(v) = std::env::var(&self.name) {
//!             values.insert(self.name.clone(), v.into());
//!         }
//!         Ok(values)
//!     }
//!
//!     fn apply_settings(&mut self) -> anyhow::Result<ApplySettingsOutcome> {
//!         anyhow::bail!("read-only environment")
//!     }
//! }
//! ```
//!
//! Errors returned from these methods become the unit's result. Return a
//! [`crate::UnitFailure`] to report a specific result code.

use crate::set::ConfigurationSet;
use crate::types::ApplySettingsOutcome;
use crate::unit::{ConfigurationUnit, ValueSet};
use anyhow::Result;

/// Tests, reads and applies a single unit
pub trait UnitProcessor: Send {
    /// Whether the system is already in the state the unit describes
    fn test_settings(&mut self) -> Result<bool>;

    /// Read the unit's current settings from the system
    fn get_settings(&mut self) -> Result<ValueSet>;

    /// Converge the system to the state the unit describes
    fn apply_settings(&mut self) -> Result<ApplySettingsOutcome>;
}

/// Per-set provider session
pub trait SetProcessor: Send + Sync {
    /// Create the processor for one unit of the set
    fn create_unit_processor(&self, unit: &ConfigurationUnit) -> Result<Box<dyn UnitProcessor>>;
}

/// Creates provider sessions for sets
pub trait SetProcessorFactory: Send + Sync {
    fn create_set_processor(&self, set: &ConfigurationSet) -> Result<Box<dyn SetProcessor>>;
}

/// A boxed set processor for type-erased storage
pub type BoxedSetProcessor = Box<dyn SetProcessor>;
