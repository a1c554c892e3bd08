//! Dependency graph bookkeeping for the apply processor

use crate::codes;
use crate::types::{Intent, ResultSource, UnitResult, UnitState};
use crate::unit::ConfigurationUnit;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Normalize a unit identifier for comparison
///
/// Identifiers compare case-insensitively and ignore surrounding whitespace.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Processing state for one unit
#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub unit: ConfigurationUnit,
    /// Positions of the units this one depends on
    pub dependency_indices: Vec<usize>,
    pub result: UnitResult,
    pub preprocessed: bool,
    pub processed: bool,
}

impl UnitInfo {
    pub fn new(unit: ConfigurationUnit) -> Self {
        Self {
            result: UnitResult::pending(unit.clone()),
            unit,
            dependency_indices: Vec::new(),
            preprocessed: false,
            processed: false,
        }
    }

    pub fn intent(&self) -> Intent {
        self.unit.intent
    }

    /// Record a result code, clearing description and details
    pub fn set_result(&mut self, code: i32, source: ResultSource) {
        self.result.result_information.initialize(code, source);
    }

    pub fn set_state(&mut self, state: UnitState) {
        self.result.state = state;
    }

    /// Processed, and the recorded result is a success
    pub fn has_processed_successfully(&self) -> bool {
        self.processed && codes::succeeded(self.result.result_information.code)
    }
}

/// Maps normalized identifiers to unit positions
#[derive(Debug, Default)]
pub struct IdentifierMap {
    indices: HashMap<String, usize>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an identifier
    ///
    /// Empty identifiers are never inserted. Returns the position of the
    /// unit already holding the same normalized identifier, if any.
    pub fn insert(&mut self, identifier: &str, index: usize) -> Option<usize> {
        if identifier.is_empty() {
            return None;
        }

        match self.indices.entry(normalize_identifier(identifier)) {
            Entry::Occupied(existing) => Some(*existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(index);
                None
            }
        }
    }

    pub fn resolve(&self, identifier: &str) -> Option<usize> {
        self.indices.get(&normalize_identifier(identifier)).copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.indices.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
