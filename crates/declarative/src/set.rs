//! Configuration sets

use crate::parser::ParsedSet;
use crate::unit::{ConfigurationUnit, UnitEnvironment, ValueSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordered collection of units applied together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSet {
    pub instance_identifier: Uuid,
    pub name: String,
    /// Where the set came from (for example a repository URL)
    pub origin: String,
    /// File the set was read from, if any
    pub path: String,
    pub schema_version: String,
    pub units: Vec<ConfigurationUnit>,
    pub parameters: ValueSet,
    pub variables: ValueSet,
    pub metadata: ValueSet,
    pub environment: UnitEnvironment,
    /// Set by the history store on the first apply
    pub first_apply: Option<DateTime<Utc>>,
}

impl ConfigurationSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            instance_identifier: Uuid::new_v4(),
            name: name.into(),
            origin: String::new(),
            path: String::new(),
            schema_version: String::new(),
            units: Vec::new(),
            parameters: ValueSet::new(),
            variables: ValueSet::new(),
            metadata: ValueSet::new(),
            environment: UnitEnvironment::default(),
            first_apply: None,
        }
    }

    /// Build a set from parser output
    pub fn from_parsed(parsed: ParsedSet) -> Self {
        let mut set = Self::new(String::new());
        set.schema_version = parsed.schema_version;
        set.units = parsed.units;
        set.parameters = parsed.parameters;
        set.variables = parsed.variables;
        set.metadata = parsed.metadata;
        set
    }

    pub fn with_units(mut self, units: Vec<ConfigurationUnit>) -> Self {
        self.units = units;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>, path: impl Into<String>) -> Self {
        self.origin = origin.into();
        self.path = path.into();
        self
    }

    /// Total number of units, including group members at every depth
    pub fn unit_count(&self) -> usize {
        fn count(units: &[ConfigurationUnit]) -> usize {
            units.iter().map(|u| 1 + count(u.units())).sum()
        }
        count(&self.units)
    }
}
