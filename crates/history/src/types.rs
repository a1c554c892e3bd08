//! Data types for the history crate

use chrono::{DateTime, Utc};
use declarative::{ResultInformation, SetState, UnitState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Where and how to open the database
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Path to the SQLite file
    pub path: PathBuf,
    /// How long to wait on a locked database before failing
    pub busy_timeout: Duration,
}

impl DatabaseOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(5000),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

/// A pending or active apply operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub set_instance_identifier: Uuid,
    /// Name of the named object that stays alive while the operation does
    pub object_name: String,
    pub queued_at: DateTime<Utc>,
    /// Process that queued the operation
    pub process_id: u32,
    /// The operation currently holds the apply lock
    pub active: bool,
}

/// A registered change listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeListenerItem {
    /// Base name of the listener's event pair
    pub object_name: String,
    pub started: DateTime<Utc>,
    pub process_id: u32,
}

/// One row of the status change log
///
/// Rows without a unit identifier describe the set itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusItem {
    /// Strictly increasing across all status mutations
    pub change_identifier: i64,
    pub change_time: DateTime<Utc>,
    pub set_instance_identifier: Uuid,
    pub in_queue: bool,
    pub unit_instance_identifier: Option<Uuid>,
    /// Raw state; a [`SetState`] for set rows, a [`UnitState`] for unit rows
    pub state: i32,
    pub result_information: Option<ResultInformation>,
}

impl StatusItem {
    pub fn is_set_status(&self) -> bool {
        self.unit_instance_identifier.is_none()
    }

    pub fn set_state(&self) -> SetState {
        SetState::from_i32(self.state)
    }

    pub fn unit_state(&self) -> UnitState {
        UnitState::from_i32(self.state)
    }
}

/// Starting point for a new status reader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBaseline {
    /// Latest change identifier; read changes after this one
    pub change_identifier: i64,
    /// Current status of every set
    pub sets: Vec<StatusItem>,
}
