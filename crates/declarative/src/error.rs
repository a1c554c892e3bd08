//! Error types for the declarative crate

use crate::codes;
use crate::types::{ResultInformation, ResultSource};
use thiserror::Error;

/// Errors that stop the apply engine itself
///
/// Unit-level failures are never reported through this type; they are
/// recorded in the unit's [`ResultInformation`] instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The set processor could not be created for a set
    #[error("failed to create set processor: {0}")]
    SetProcessor(#[source] anyhow::Error),
}

/// Result type for declarative operations
pub type Result<T> = std::result::Result<T, Error>;

/// A structured failure raised by a unit processor
///
/// Providers return this (directly or wrapped in an `anyhow` context chain)
/// to report a specific result code. Any other error is recorded as
/// [`codes::E_FAIL`] with the error message as description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description} (0x{code:08X})")]
pub struct UnitFailure {
    /// HRESULT-style failure code
    pub code: i32,
    /// Human-readable description
    pub description: String,
    /// Extra diagnostic details
    pub details: String,
    /// Where the failure originated
    pub result_source: ResultSource,
}

impl UnitFailure {
    /// Create a failure raised while processing a unit
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: String::new(),
            result_source: ResultSource::UnitProcessing,
        }
    }

    /// Attach details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Override the failure source
    pub fn with_source(mut self, source: ResultSource) -> Self {
        self.result_source = source;
        self
    }
}

impl From<UnitFailure> for ResultInformation {
    fn from(failure: UnitFailure) -> Self {
        Self {
            code: failure.code,
            description: failure.description,
            details: failure.details,
            source: failure.result_source,
        }
    }
}

/// Convert a provider error into result information
///
/// A [`UnitFailure`] anywhere in the chain keeps its code; anything else
/// becomes `E_FAIL` with the full context chain as description.
pub fn extract_result_information(error: &anyhow::Error) -> ResultInformation {
    if let Some(failure) = error.chain().find_map(|e| e.downcast_ref::<UnitFailure>()) {
        return failure.clone().into();
    }

    ResultInformation {
        code: codes::E_FAIL,
        description: format!("{error:#}"),
        details: String::new(),
        source: ResultSource::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_extract_unit_failure() {
        let err: anyhow::Error = UnitFailure::new(codes::TEST_FAILED, "probe failed")
            .with_details("exit code 3")
            .into();
        let info = extract_result_information(&err);
        assert_eq!(info.code, codes::TEST_FAILED);
        assert_eq!(info.description, "probe failed");
        assert_eq!(info.details, "exit code 3");
        assert_eq!(info.source, ResultSource::UnitProcessing);
    }

    #[test]
    fn test_extract_wrapped_unit_failure() {
        let err = Err::<(), _>(UnitFailure::new(codes::GET_FAILED, "inner"))
            .context("while reading settings")
            .unwrap_err();
        let info = extract_result_information(&err);
        assert_eq!(info.code, codes::GET_FAILED);
    }

    #[test]
    fn test_extract_generic_error() {
        let err = anyhow::anyhow!("disk on fire");
        let info = extract_result_information(&err);
        assert_eq!(info.code, codes::E_FAIL);
        assert_eq!(info.description, "disk on fire");
        assert_eq!(info.source, ResultSource::Internal);
    }
}
