//! # Configset
//!
//! Apply configuration sets one at a time per machine, keep a history of
//! what was applied, and watch status live from any process.
//!
//! The apply engine lives in [`declarative`] and the SQLite status store in
//! [`history`]. This crate adds the machine-wide pieces:
//!
//! - [`ConfigurationSequencer`]: a named mutex plus a persistent queue, so
//!   only the first live operation in line applies
//! - [`ConfigurationStatus`]: status reads and writes, and change
//!   registrations fed by a [`ChangeListener`]
//! - [`ConfigurationProcessor`]: history, queue, status and apply in one call
//!
//! ## Example
//!
//! ```ignore
//! use configset::{
//!     ApplyOptions, ConfigurationProcessor, ConfigurationStatus, LocalNamespace, Settings,
//! };
//! use declarative::CancellationToken;
//! use std::sync::Arc;
//!
//! let status = ConfigurationStatus::from_settings(Settings::load()?, Arc::new(LocalNamespace::new()))?;
//! let _watch = status.register_for_set_change(set.instance_identifier, |change| {
//!     println!("{:?}", change.state);
//! })?;
//!
//! let processor = ConfigurationProcessor::new(factory, status);
//! let result = processor.apply_set(&set, ApplyOptions::default(), &CancellationToken::new())?;
//! println!("{}", declarative::codes::describe(result.result_code));
//! ```

pub mod error;
pub mod named;
pub mod paths;
pub mod processor;
pub mod sequencer;
pub mod settings;
pub mod signal;
pub mod status;

pub use error::{Error, Result};
pub use named::{AdvisoryLock, LocalNamespace, NamedObject, ObjectNamespace};
pub use processor::{ApplyOptions, ConfigurationProcessor};
pub use sequencer::ConfigurationSequencer;
pub use settings::Settings;
pub use signal::{ChangeSignaler, ManualResetEvent};
pub use status::{
    ChangeKind, ChangeListener, ChangeRegistration, ChangeState, ConfigurationChange,
    ConfigurationStatus, SetChange, SetChangeRegistration,
};
