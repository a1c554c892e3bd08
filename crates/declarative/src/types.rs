//! Core types for configuration results and state

use crate::codes;
use crate::unit::ConfigurationUnit;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a unit is meant to do when its set is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Intent {
    /// Only check that the system is in the described state
    Assert,
    /// Only read the current state
    Inform,
    /// Converge the system to the described state
    #[default]
    Apply,
    /// Intent not specified; treated as `Apply`
    Unknown,
}

impl Intent {
    /// Stable integer used by the status store
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Assert => 0,
            Self::Inform => 1,
            Self::Apply => 2,
            Self::Unknown => 3,
        }
    }

    /// Inverse of [`Intent::as_i32`]; unrecognized values map to `Unknown`
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Assert,
            1 => Self::Inform,
            2 => Self::Apply,
            _ => Self::Unknown,
        }
    }
}

/// Where a result originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultSource {
    #[default]
    None,
    /// The engine itself
    Internal,
    /// A precondition of the unit was not met
    Precondition,
    /// The structure of the set (identifiers, dependencies)
    ConfigurationSet,
    /// The unit processor
    UnitProcessing,
    /// The state of the system
    SystemState,
}

impl ResultSource {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Internal => 1,
            Self::Precondition => 2,
            Self::ConfigurationSet => 3,
            Self::UnitProcessing => 4,
            Self::SystemState => 5,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Internal,
            2 => Self::Precondition,
            3 => Self::ConfigurationSet,
            4 => Self::UnitProcessing,
            5 => Self::SystemState,
            _ => Self::None,
        }
    }
}

/// Outcome details for a unit or a set
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultInformation {
    /// HRESULT-style code; see [`crate::codes`]
    pub code: i32,
    pub description: String,
    pub details: String,
    pub source: ResultSource,
}

impl ResultInformation {
    /// Result information with only a code and source
    pub fn new(code: i32, source: ResultSource) -> Self {
        Self {
            code,
            description: String::new(),
            details: String::new(),
            source,
        }
    }

    /// Reset to the given code and source, clearing description and details
    pub fn initialize(&mut self, code: i32, source: ResultSource) {
        *self = Self::new(code, source);
    }

    pub fn is_success(&self) -> bool {
        codes::succeeded(self.code)
    }
}

/// Lifecycle state of a single unit within an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UnitState {
    #[default]
    Unknown,
    /// Waiting to be processed
    Pending,
    InProgress,
    Completed,
    /// Not processed, because of a precondition or an earlier failure
    Skipped,
}

impl UnitState {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::InProgress => 2,
            Self::Completed => 3,
            Self::Skipped => 4,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::InProgress,
            3 => Self::Completed,
            4 => Self::Skipped,
            _ => Self::Unknown,
        }
    }

    /// Whether the unit has reached a final state
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Lifecycle state of a whole set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SetState {
    #[default]
    Unknown,
    /// Queued behind another apply
    Pending,
    InProgress,
    Completed,
}

impl SetState {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Pending => 1,
            Self::InProgress => 2,
            Self::Completed => 3,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::InProgress,
            3 => Self::Completed,
            _ => Self::Unknown,
        }
    }
}

/// Outcome of a successful `apply_settings` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplySettingsOutcome {
    /// The change takes full effect only after a reboot
    pub reboot_required: bool,
}

/// Result of one unit within an apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: ConfigurationUnit,
    pub state: UnitState,
    /// `test_settings` reported the unit already satisfied
    pub previously_in_desired_state: bool,
    pub reboot_required: bool,
    pub result_information: ResultInformation,
}

impl UnitResult {
    /// A result for a unit that has not been touched yet
    pub fn pending(unit: ConfigurationUnit) -> Self {
        Self {
            unit,
            state: UnitState::Pending,
            previously_in_desired_state: false,
            reboot_required: false,
            result_information: ResultInformation::default(),
        }
    }

    pub fn unit_instance_identifier(&self) -> Uuid {
        self.unit.instance_identifier
    }

    /// Whether the unit was attempted (or deliberately skipped)
    pub fn was_attempted(&self) -> bool {
        self.state.is_final()
    }

    pub fn is_success(&self) -> bool {
        self.result_information.is_success()
    }
}

/// Result of applying (or checking) a whole set
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplySetResult {
    /// Overall code; the first fatal condition encountered
    pub result_code: i32,
    /// Per-unit results, in set order
    pub unit_results: Vec<UnitResult>,
}

impl ApplySetResult {
    pub fn is_success(&self) -> bool {
        codes::succeeded(self.result_code)
    }

    /// Whether any applied unit asked for a reboot
    pub fn reboot_required(&self) -> bool {
        self.unit_results.iter().any(|r| r.reboot_required)
    }

    /// Find the result for a unit by its user-facing identifier
    pub fn find(&self, identifier: &str) -> Option<&UnitResult> {
        self.unit_results
            .iter()
            .find(|r| r.unit.identifier == identifier)
    }

    /// Count results by outcome
    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for result in &self.unit_results {
            summary.add_result(result);
        }
        summary
    }
}

/// Summary counts over unit results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    /// Units that were changed by `apply_settings`
    pub applied: usize,
    /// Units already in the desired state
    pub no_change: usize,
    /// Assert/Inform units that completed successfully
    pub checked: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Units never reached
    pub pending: usize,
}

impl ApplySummary {
    /// Check if every unit succeeded
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.pending == 0
    }

    /// Total number of units counted
    pub fn total(&self) -> usize {
        self.applied + self.no_change + self.checked + self.skipped + self.failed + self.pending
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &UnitResult) {
        match result.state {
            UnitState::Skipped => self.skipped += 1,
            UnitState::Completed if !result.is_success() => self.failed += 1,
            UnitState::Completed if result.previously_in_desired_state => self.no_change += 1,
            UnitState::Completed => match result.unit.intent {
                Intent::Apply | Intent::Unknown => self.applied += 1,
                Intent::Assert | Intent::Inform => self.checked += 1,
            },
            UnitState::Unknown | UnitState::Pending | UnitState::InProgress => {
                if result.is_success() {
                    self.pending += 1;
                } else {
                    self.failed += 1;
                }
            }
        }
    }
}
