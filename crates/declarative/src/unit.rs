//! Configuration units
//!
//! A unit is one idempotent piece of configuration: a resource type plus the
//! settings it should converge to. Units may contain other units (groups).

use crate::types::Intent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generic property bag used for settings and metadata
pub type ValueSet = BTreeMap<String, serde_json::Value>;

/// Security context a unit should run under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityContext {
    /// Whatever context the caller runs in
    #[default]
    Current,
    Restricted,
    Elevated,
}

/// Where and how a unit is processed
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitEnvironment {
    pub context: SecurityContext,
    /// Identifies the processor implementation; empty means the default one
    pub processor_identifier: String,
    pub processor_properties: BTreeMap<String, String>,
}

/// Leaf or group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum UnitKind {
    #[default]
    Leaf,
    /// A unit whose work is done by its members
    Group { units: Vec<ConfigurationUnit> },
}

/// One unit of a configuration set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationUnit {
    /// Generated at construction; never changes afterwards
    pub instance_identifier: Uuid,
    /// User-chosen identifier, unique within the set after normalization
    pub identifier: String,
    /// Resource name, e.g. `Module/Resource`
    pub unit_type: String,
    pub intent: Intent,
    /// Identifiers of units in the same set that must complete first
    pub dependencies: Vec<String>,
    pub metadata: ValueSet,
    pub settings: ValueSet,
    pub is_active: bool,
    pub environment: UnitEnvironment,
    pub kind: UnitKind,
}

impl ConfigurationUnit {
    /// Create an active leaf unit with the default intent
    pub fn new(identifier: impl Into<String>, unit_type: impl Into<String>) -> Self {
        Self {
            instance_identifier: Uuid::new_v4(),
            identifier: identifier.into(),
            unit_type: unit_type.into(),
            intent: Intent::default(),
            dependencies: Vec::new(),
            metadata: ValueSet::new(),
            settings: ValueSet::new(),
            is_active: true,
            environment: UnitEnvironment::default(),
            kind: UnitKind::Leaf,
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    /// Add a dependency on another unit's identifier
    pub fn depends_on(mut self, identifier: impl Into<String>) -> Self {
        self.dependencies.push(identifier.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn with_environment(mut self, environment: UnitEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Turn this unit into a group of the given members
    pub fn with_units(mut self, units: Vec<ConfigurationUnit>) -> Self {
        self.kind = UnitKind::Group { units };
        self
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, UnitKind::Group { .. })
    }

    /// Group members; empty for leaves
    pub fn units(&self) -> &[ConfigurationUnit] {
        match &self.kind {
            UnitKind::Leaf => &[],
            UnitKind::Group { units } => units,
        }
    }
}
