//! Versioned database schema
//!
//! Each schema version is an additive superset of the one before it:
//!
//! | Version | Adds |
//! |---------|------|
//! | 0.1 | `set_info`, `unit_info` |
//! | 0.2 | `queue` |
//! | 0.3 | `change_listeners`, `status_items` |
//!
//! A [`ConfigurationDatabaseSchema`] implementation exists per version.
//! Operations a version does not have degrade: reads return empty values,
//! writes fail with [`Error::NotSupported`].

mod v0_1;
mod v0_2;
mod v0_3;

pub use v0_1::V0_1;
pub use v0_2::V0_2;
pub use v0_3::V0_3;

use crate::error::{Error, Result};
use crate::types::{ChangeListenerItem, QueueItem, StatusBaseline, StatusItem};
use chrono::{DateTime, Utc};
use declarative::{ConfigurationSet, ResultInformation, SetState, UnitState};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Schema version stored in the `metadata` table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The newest version this build can create and migrate to
    pub const LATEST: Self = V0_3::VERSION;
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Operations on the configuration database at one schema version
///
/// Every method runs inside a savepoint owned by the caller, except
/// [`Self::initialize_database`] and [`Self::migrate_from`], which manage
/// their own.
pub trait ConfigurationDatabaseSchema: Send + Sync {
    fn version(&self) -> SchemaVersion;

    /// Create every table of this version in an empty database
    fn initialize_database(&self, conn: &mut Connection) -> Result<()>;

    /// Upgrade a database at `from` to this version, one version at a time
    fn migrate_from(&self, conn: &mut Connection, from: SchemaVersion) -> Result<()>;

    // Sets (0.1)

    /// Store a new set and its units; returns the set's row id
    fn add_set(&self, conn: &Connection, set: &ConfigurationSet) -> Result<i64>;

    /// Replace a stored set's values and units
    fn update_set(&self, conn: &Connection, row_id: i64, set: &ConfigurationSet) -> Result<()>;

    fn remove_set(&self, conn: &Connection, row_id: i64) -> Result<()>;

    fn get_set_row_id(&self, conn: &Connection, instance_identifier: &Uuid) -> Result<Option<i64>>;

    fn get_sets(&self, conn: &Connection) -> Result<Vec<ConfigurationSet>>;

    fn get_set(&self, conn: &Connection, instance_identifier: &Uuid)
    -> Result<Option<ConfigurationSet>>;

    fn get_set_first_apply(
        &self,
        conn: &Connection,
        instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>>;

    // Queue (0.2)

    fn add_queue_item(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
        _object_name: &str,
        _process_id: u32,
    ) -> Result<()> {
        Err(self.not_supported("add_queue_item"))
    }

    fn set_active_queue_item(&self, _conn: &Connection, _object_name: &str) -> Result<()> {
        Err(self.not_supported("set_active_queue_item"))
    }

    /// Queue rows in arrival order
    fn get_queue_items(&self, _conn: &Connection) -> Result<Vec<QueueItem>> {
        Ok(Vec::new())
    }

    fn remove_queue_item(&self, _conn: &Connection, _object_name: &str) -> Result<()> {
        Err(self.not_supported("remove_queue_item"))
    }

    // Change listeners and status (0.3)

    fn add_listener(&self, _conn: &Connection, _object_name: &str, _process_id: u32) -> Result<()> {
        Err(self.not_supported("add_listener"))
    }

    fn remove_listener(&self, _conn: &Connection, _object_name: &str) -> Result<()> {
        Err(self.not_supported("remove_listener"))
    }

    fn get_change_listeners(&self, _conn: &Connection) -> Result<Vec<ChangeListenerItem>> {
        Ok(Vec::new())
    }

    fn update_set_state(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
        _state: SetState,
    ) -> Result<()> {
        Err(self.not_supported("update_set_state"))
    }

    fn update_set_in_queue(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
        _in_queue: bool,
    ) -> Result<()> {
        Err(self.not_supported("update_set_in_queue"))
    }

    fn update_unit_state(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
        _unit_instance_identifier: &Uuid,
        _state: UnitState,
        _result: Option<&ResultInformation>,
    ) -> Result<()> {
        Err(self.not_supported("update_unit_state"))
    }

    fn get_set_state(&self, _conn: &Connection, _set_instance_identifier: &Uuid) -> Result<SetState> {
        Ok(SetState::Unknown)
    }

    fn get_set_apply_begun(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    /// Only known once the set has left the queue
    fn get_set_apply_ended(
        &self,
        _conn: &Connection,
        _set_instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }

    fn get_unit_state(&self, _conn: &Connection, _unit_instance_identifier: &Uuid) -> Result<UnitState> {
        Ok(UnitState::Unknown)
    }

    fn get_unit_result_information(
        &self,
        _conn: &Connection,
        _unit_instance_identifier: &Uuid,
    ) -> Result<Option<ResultInformation>> {
        Ok(None)
    }

    /// Status rows changed after `change_identifier`, oldest first
    fn get_status_since(&self, _conn: &Connection, _change_identifier: i64) -> Result<Vec<StatusItem>> {
        Ok(Vec::new())
    }

    fn get_status_baseline(&self, _conn: &Connection) -> Result<StatusBaseline> {
        Ok(StatusBaseline::default())
    }

    #[doc(hidden)]
    fn not_supported(&self, operation: &'static str) -> Error {
        Error::NotSupported {
            operation,
            version: self.version(),
        }
    }
}

/// Read the stored schema version; `None` for an empty database
pub fn read_version(conn: &Connection) -> Result<Option<SchemaVersion>> {
    let has_metadata: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata')",
        [],
        |row| row.get(0),
    )?;
    if !has_metadata {
        return Ok(None);
    }

    let read = |name: &str| -> Result<Option<u32>> {
        let value = conn
            .query_row("SELECT value FROM metadata WHERE name = ?1", [name], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        value
            .map(|value| {
                u32::try_from(value).map_err(|_| Error::InvalidSchemaVersion {
                    name: name.to_string(),
                    value,
                })
            })
            .transpose()
    };

    match (read("major_version")?, read("minor_version")?) {
        (Some(major), Some(minor)) => Ok(Some(SchemaVersion::new(major, minor))),
        _ => Ok(None),
    }
}

pub(crate) fn write_version(conn: &Connection, version: SchemaVersion) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            name TEXT PRIMARY KEY NOT NULL,
            value INTEGER NOT NULL
        );",
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO metadata (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
    )?;
    stmt.execute(params!["major_version", i64::from(version.major)])?;
    stmt.execute(params!["minor_version", i64::from(version.minor)])?;
    Ok(())
}

/// The interface for exactly `version`
pub fn schema_for(version: SchemaVersion) -> Result<Box<dyn ConfigurationDatabaseSchema>> {
    match (version.major, version.minor) {
        (0, 1) => Ok(Box::new(V0_1)),
        (0, 2) => Ok(Box::new(V0_2)),
        (0, 3) => Ok(Box::new(V0_3)),
        _ => Err(Error::UnsupportedSchemaVersion(version)),
    }
}

/// The interface for the database on `conn`
///
/// With `allow_migration`, an older database is first upgraded to
/// [`SchemaVersion::LATEST`]. A version newer than latest, or with an
/// unknown major version, is never opened.
pub fn create_for(
    conn: &mut Connection,
    allow_migration: bool,
) -> Result<Box<dyn ConfigurationDatabaseSchema>> {
    let version = read_version(conn)?.ok_or(Error::Uninitialized)?;
    let latest = SchemaVersion::LATEST;

    if version.major != latest.major || version > latest {
        return Err(Error::UnsupportedSchemaVersion(version));
    }

    if version < latest && allow_migration {
        log::info!("Migrating configuration database from {version} to {latest}");
        let schema = schema_for(latest)?;
        schema.migrate_from(conn, version)?;
        return Ok(schema);
    }

    schema_for(version)
}

// ============================================================================
// Row helpers shared by the version modules
// ============================================================================

pub(crate) fn uuid_to_blob(id: &Uuid) -> Vec<u8> {
    id.as_bytes().to_vec()
}

pub(crate) fn uuid_from_blob(column: usize, bytes: &[u8]) -> rusqlite::Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Blob, Box::new(e))
    })
}

pub(crate) fn time_from_epoch(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}
