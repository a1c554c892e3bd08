//! # Declarative
//!
//! The configuration-set apply engine.
//!
//! A [`ConfigurationSet`] is an ordered list of idempotent
//! [`ConfigurationUnit`]s with dependencies between them. The
//! [`ConfigurationSetApplyProcessor`] validates the dependency graph and
//! processes the units in dependency order, all `Assert` units first, then
//! `Inform`, then `Apply`, recording one [`UnitResult`] per unit.
//!
//! ## Core Concepts
//!
//! - **Unit**: one resource and the settings it should converge to
//! - **Intent**: whether a unit is only checked, only read, or applied
//! - **Result codes**: HRESULT-style `i32` values, see [`codes`]
//! - **Apply processor**: dependency resolution and intent-ordered execution
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     CancellationToken, ConfigurationSet, ConfigurationSetApplyProcessor,
//!     ConfigurationUnit, Intent, NoProgress,
//! };
//!
//! let set = ConfigurationSet::new("dev box").with_units(vec![
//!     ConfigurationUnit::new("os", "OS/Version").with_intent(Intent::Assert),
//!     ConfigurationUnit::new("git", "Git/Install").depends_on("os"),
//! ]);
//!
//! let set_processor = factory.create_set_processor(&set)?;
//! let token = CancellationToken::new();
//! let mut processor =
//!     ConfigurationSetApplyProcessor::for_set(&set, set_processor.as_ref(), &mut NoProgress, &token);
//! processor.process(false)?;
//! println!("{}", declarative::codes::describe(processor.result().result_code));
//! ```
//!
//! ## Provider Traits
//!
//! The crate never touches the system itself:
//!
//! - [`SetProcessorFactory`] / [`SetProcessor`] / [`UnitProcessor`]: test,
//!   read and apply units
//! - [`ProgressSink`]: receives unit state transitions
//! - [`SetParser`]: produces units from a document

pub mod cancel;
pub mod codes;
pub mod context;
pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod processor;
pub mod set;
pub mod types;
pub mod unit;

// Re-export main types at crate root
pub use cancel::{CancelRegistration, CancellationToken};
pub use context::{NoProgress, ProgressSink};
pub use error::{Error, Result, UnitFailure, extract_result_information};
pub use executor::ConfigurationSetApplyProcessor;
pub use parser::{ParseError, ParsedSet, SetParser};
pub use planner::{UnitInfo, normalize_identifier};
pub use processor::{BoxedSetProcessor, SetProcessor, SetProcessorFactory, UnitProcessor};
pub use set::ConfigurationSet;
pub use types::{
    ApplySetResult, ApplySettingsOutcome, ApplySummary, Intent, ResultInformation, ResultSource,
    SetState, UnitResult, UnitState,
};
pub use unit::{ConfigurationUnit, SecurityContext, UnitEnvironment, UnitKind, ValueSet};
