//! Error types for configset

use thiserror::Error;

/// Errors that stop a set from being applied or observed
///
/// These are infrastructure failures. Unit failures are recorded in the
/// apply result, never returned here.
#[derive(Error, Debug)]
pub enum Error {
    /// The history database failed
    #[error("history error: {0}")]
    History(#[from] history::Error),

    /// The apply engine stopped
    #[error("apply error: {0}")]
    Apply(#[from] declarative::Error),

    /// The operation was cancelled while waiting
    #[error("operation cancelled")]
    Cancelled,

    /// A named synchronization object could not be created or opened
    #[error("named object {name}: {reason}")]
    NamedObject { name: String, reason: String },

    /// Settings or path resolution failed
    #[error("settings error: {0:#}")]
    Settings(#[source] anyhow::Error),
}

/// Result type for configset operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn named_object(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NamedObject {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
