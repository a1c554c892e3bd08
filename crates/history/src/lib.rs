//! # History
//!
//! Persistent configuration-set history backed by SQLite.
//!
//! This crate provides functionality to:
//! - Record every applied set with its full unit tree
//! - Track the cross-process apply queue
//! - Log set and unit status changes with monotonically increasing change
//!   identifiers, so other processes can follow an apply from outside
//! - Migrate older databases forward, and keep working against a database
//!   another process migrated underneath us
//!
//! ## Example
//!
//! ```no_run
//! use declarative::{ConfigurationSet, SetState};
//! use history::{ConfigurationDatabase, DatabaseOptions};
//!
//! let database = ConfigurationDatabase::new(DatabaseOptions::new("/tmp/History/config.db"));
//! database.ensure_opened(true)?;
//!
//! let set = ConfigurationSet::new("dev box");
//! database.write_set_history(&set)?;
//! database.update_set_state(&set.instance_identifier, SetState::Pending)?;
//!
//! for stored in database.get_set_history()? {
//!     println!("{} first applied {:?}", stored.name, stored.first_apply);
//! }
//! # Ok::<(), history::Error>(())
//! ```

mod error;
pub mod schema;
mod types;

pub use error::{Error, Result};
pub use schema::{ConfigurationDatabaseSchema, SchemaVersion};
pub use types::{ChangeListenerItem, DatabaseOptions, QueueItem, StatusBaseline, StatusItem};

use chrono::{DateTime, Utc};
use declarative::{ConfigurationSet, ResultInformation, SetState, UnitState};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

struct Opened {
    conn: Connection,
    schema: Box<dyn ConfigurationDatabaseSchema>,
}

/// Swap in the interface for the on-disk version if another process migrated it
fn refresh_schema(
    schema: &mut Box<dyn ConfigurationDatabaseSchema>,
    conn: &Connection,
) -> Result<()> {
    match schema::read_version(conn)? {
        Some(version) if version != schema.version() => {
            log::debug!(
                "Configuration database moved from {} to {version}",
                schema.version()
            );
            *schema = schema::schema_for(version)?;
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(Error::Uninitialized),
    }
}

/// The configuration history database
///
/// Starts closed. Reads against a closed database return empty values;
/// writes fail with [`Error::NotOpened`].
pub struct ConfigurationDatabase {
    options: DatabaseOptions,
    state: Mutex<Option<Opened>>,
}

impl ConfigurationDatabase {
    pub fn new(options: DatabaseOptions) -> Self {
        Self {
            options,
            state: Mutex::new(None),
        }
    }

    /// Open the database if it is not open yet
    ///
    /// A missing database is created at the latest schema version only when
    /// `create_if_needed` is set; otherwise the database stays closed. An
    /// existing database is migrated forward.
    pub fn ensure_opened(&self, create_if_needed: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let path = &self.options.path;
        if !create_if_needed && !path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(self.options.busy_timeout)?;

        let schema = match schema::read_version(&conn)? {
            Some(_) => schema::create_for(&mut conn, true)?,
            None if create_if_needed => {
                let schema = schema::schema_for(SchemaVersion::LATEST)?;
                schema.initialize_database(&mut conn)?;
                log::info!(
                    "Created configuration database {} at version {}",
                    path.display(),
                    SchemaVersion::LATEST
                );
                schema
            }
            None => return Ok(()),
        };

        *state = Some(Opened { conn, schema });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Version of the interface currently in use
    pub fn schema_version(&self) -> Option<SchemaVersion> {
        self.state.lock().as_ref().map(|opened| opened.schema.version())
    }

    fn read<T: Default>(
        &self,
        name: &str,
        op: impl FnOnce(&dyn ConfigurationDatabaseSchema, &Connection) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let Some(opened) = state.as_mut() else {
            return Ok(T::default());
        };

        let sp = opened.conn.savepoint_with_name(name)?;
        refresh_schema(&mut opened.schema, &sp)?;
        let value = op(opened.schema.as_ref(), &sp)?;
        sp.commit()?;
        Ok(value)
    }

    fn write<T>(
        &self,
        name: &str,
        op: impl FnOnce(&dyn ConfigurationDatabaseSchema, &Connection) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let opened = state.as_mut().ok_or(Error::NotOpened)?;

        log::trace!("Begin {name}");
        let tx = opened
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        refresh_schema(&mut opened.schema, &tx)?;
        let value = op(opened.schema.as_ref(), &tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Set history
    // ------------------------------------------------------------------

    /// Every stored set, oldest first
    pub fn get_set_history(&self) -> Result<Vec<ConfigurationSet>> {
        self.read("get_set_history", |schema, conn| schema.get_sets(conn))
    }

    pub fn get_set(&self, instance_identifier: &Uuid) -> Result<Option<ConfigurationSet>> {
        self.read("get_set", |schema, conn| {
            schema.get_set(conn, instance_identifier)
        })
    }

    /// Store a set, replacing the stored copy if the instance is known
    pub fn write_set_history(&self, set: &ConfigurationSet) -> Result<()> {
        self.write("write_set_history", |schema, conn| {
            match schema.get_set_row_id(conn, &set.instance_identifier)? {
                Some(row_id) => schema.update_set(conn, row_id, set),
                None => schema.add_set(conn, set).map(|_| ()),
            }
        })
    }

    /// Forget a set; a no-op if the set is unknown or the database is closed
    pub fn remove_set_history(&self, instance_identifier: &Uuid) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.write("remove_set_history", |schema, conn| {
            match schema.get_set_row_id(conn, instance_identifier)? {
                Some(row_id) => schema.remove_set(conn, row_id),
                None => Ok(()),
            }
        })
    }

    pub fn get_set_first_apply(&self, instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.read("get_set_first_apply", |schema, conn| {
            schema.get_set_first_apply(conn, instance_identifier)
        })
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Record that this process queued an apply of the set
    pub fn add_queue_item(&self, set_instance_identifier: &Uuid, object_name: &str) -> Result<()> {
        self.write("add_queue_item", |schema, conn| {
            schema.add_queue_item(conn, set_instance_identifier, object_name, std::process::id())
        })
    }

    pub fn set_active_queue_item(&self, object_name: &str) -> Result<()> {
        self.write("set_active_queue_item", |schema, conn| {
            schema.set_active_queue_item(conn, object_name)
        })
    }

    /// Queue entries in arrival order
    pub fn get_queue_items(&self) -> Result<Vec<QueueItem>> {
        self.read("get_queue_items", |schema, conn| schema.get_queue_items(conn))
    }

    pub fn remove_queue_item(&self, object_name: &str) -> Result<()> {
        self.write("remove_queue_item", |schema, conn| {
            schema.remove_queue_item(conn, object_name)
        })
    }

    // ------------------------------------------------------------------
    // Change listeners
    // ------------------------------------------------------------------

    pub fn add_listener(&self, object_name: &str) -> Result<()> {
        self.write("add_listener", |schema, conn| {
            schema.add_listener(conn, object_name, std::process::id())
        })
    }

    pub fn remove_listener(&self, object_name: &str) -> Result<()> {
        self.write("remove_listener", |schema, conn| {
            schema.remove_listener(conn, object_name)
        })
    }

    pub fn get_change_listeners(&self) -> Result<Vec<ChangeListenerItem>> {
        self.read("get_change_listeners", |schema, conn| {
            schema.get_change_listeners(conn)
        })
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn update_set_state(&self, set_instance_identifier: &Uuid, state: SetState) -> Result<()> {
        self.write("update_set_state", |schema, conn| {
            schema.update_set_state(conn, set_instance_identifier, state)
        })
    }

    pub fn update_set_in_queue(&self, set_instance_identifier: &Uuid, in_queue: bool) -> Result<()> {
        self.write("update_set_in_queue", |schema, conn| {
            schema.update_set_in_queue(conn, set_instance_identifier, in_queue)
        })
    }

    pub fn update_unit_state(
        &self,
        set_instance_identifier: &Uuid,
        unit_instance_identifier: &Uuid,
        state: UnitState,
        result: Option<&ResultInformation>,
    ) -> Result<()> {
        self.write("update_unit_state", |schema, conn| {
            schema.update_unit_state(
                conn,
                set_instance_identifier,
                unit_instance_identifier,
                state,
                result,
            )
        })
    }

    pub fn get_set_state(&self, instance_identifier: &Uuid) -> Result<SetState> {
        self.read("get_set_state", |schema, conn| {
            schema.get_set_state(conn, instance_identifier)
        })
    }

    pub fn get_set_apply_begun(&self, instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.read("get_set_apply_begun", |schema, conn| {
            schema.get_set_apply_begun(conn, instance_identifier)
        })
    }

    /// When the last apply of the set finished; `None` while it is still queued
    pub fn get_set_apply_ended(&self, instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.read("get_set_apply_ended", |schema, conn| {
            schema.get_set_apply_ended(conn, instance_identifier)
        })
    }

    pub fn get_unit_state(&self, instance_identifier: &Uuid) -> Result<UnitState> {
        self.read("get_unit_state", |schema, conn| {
            schema.get_unit_state(conn, instance_identifier)
        })
    }

    pub fn get_unit_result_information(
        &self,
        instance_identifier: &Uuid,
    ) -> Result<Option<ResultInformation>> {
        self.read("get_unit_result_information", |schema, conn| {
            schema.get_unit_result_information(conn, instance_identifier)
        })
    }

    /// Status rows changed after `change_identifier`, oldest first
    pub fn get_status_since(&self, change_identifier: i64) -> Result<Vec<StatusItem>> {
        self.read("get_status_since", |schema, conn| {
            schema.get_status_since(conn, change_identifier)
        })
    }

    pub fn get_status_baseline(&self) -> Result<StatusBaseline> {
        self.read("get_status_baseline", |schema, conn| {
            schema.get_status_baseline(conn)
        })
    }
}

impl std::fmt::Debug for ConfigurationDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationDatabase")
            .field("path", &self.options.path)
            .field("schema_version", &self.schema_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{ConfigurationUnit, ResultSource, codes};
    use schema::{V0_1, V0_2};
    use tempfile::TempDir;

    fn db_path(tmp: &TempDir) -> std::path::PathBuf {
        tmp.path().join("History").join("config.db")
    }

    fn open(tmp: &TempDir) -> ConfigurationDatabase {
        let database = ConfigurationDatabase::new(DatabaseOptions::new(db_path(tmp)));
        database.ensure_opened(true).unwrap();
        database
    }

    #[test]
    fn test_closed_database() {
        let tmp = TempDir::new().unwrap();
        let database = ConfigurationDatabase::new(DatabaseOptions::new(db_path(&tmp)));

        database.ensure_opened(false).unwrap();
        assert!(!database.is_open());
        assert!(!db_path(&tmp).exists());

        let set = ConfigurationSet::new("closed");
        assert!(database.get_set_history().unwrap().is_empty());
        assert_eq!(database.get_set_state(&set.instance_identifier).unwrap(), SetState::Unknown);
        assert!(database.remove_set_history(&set.instance_identifier).is_ok());
        assert!(matches!(database.write_set_history(&set), Err(Error::NotOpened)));
    }

    #[test]
    fn test_create_at_latest() {
        let tmp = TempDir::new().unwrap();
        let database = open(&tmp);
        assert!(database.is_open());
        assert_eq!(database.schema_version(), Some(SchemaVersion::LATEST));

        // Reopening an existing database does not need create
        let again = ConfigurationDatabase::new(DatabaseOptions::new(db_path(&tmp)));
        again.ensure_opened(false).unwrap();
        assert!(again.is_open());
    }

    #[test]
    fn test_write_set_history_adds_then_updates() {
        let tmp = TempDir::new().unwrap();
        let database = open(&tmp);
        let mut set = ConfigurationSet::new("dev box")
            .with_units(vec![ConfigurationUnit::new("git", "Git/Install")]);

        database.write_set_history(&set).unwrap();
        let first_apply = database.get_set_first_apply(&set.instance_identifier).unwrap();
        assert!(first_apply.is_some());

        set.name = "renamed".to_string();
        database.write_set_history(&set).unwrap();

        let history = database.get_set_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "renamed");
        assert_eq!(history[0].first_apply, first_apply);

        database.remove_set_history(&set.instance_identifier).unwrap();
        assert!(database.get_set(&set.instance_identifier).unwrap().is_none());
        // Removing again is harmless
        database.remove_set_history(&set.instance_identifier).unwrap();
    }

    #[test]
    fn test_old_database_is_migrated_on_open() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(db_path(&tmp).parent().unwrap()).unwrap();
        let set = ConfigurationSet::new("from 0.1");
        {
            let mut conn = Connection::open(db_path(&tmp)).unwrap();
            V0_1.initialize_database(&mut conn).unwrap();
            V0_1.add_set(&conn, &set).unwrap();
        }

        let database = open(&tmp);
        assert_eq!(database.schema_version(), Some(SchemaVersion::LATEST));
        assert_eq!(database.get_set_history().unwrap().len(), 1);
        database.add_queue_item(&set.instance_identifier, "queue_item").unwrap();
        assert_eq!(database.get_queue_items().unwrap()[0].process_id, std::process::id());
    }

    #[test]
    fn test_follows_migration_by_another_process() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(db_path(&tmp).parent().unwrap()).unwrap();
        let mut conn = Connection::open(db_path(&tmp)).unwrap();
        V0_2.initialize_database(&mut conn).unwrap();

        // Open without migrating, as a reader pinned to 0.2 would
        let database = ConfigurationDatabase::new(DatabaseOptions::new(db_path(&tmp)));
        {
            let mut state = database.state.lock();
            let mut own = Connection::open(db_path(&tmp)).unwrap();
            let schema = schema::create_for(&mut own, false).unwrap();
            *state = Some(Opened { conn: own, schema });
        }
        assert_eq!(database.schema_version(), Some(V0_2::VERSION));
        assert!(database.get_change_listeners().unwrap().is_empty());

        schema::V0_3.migrate_from(&mut conn, V0_2::VERSION).unwrap();

        database.add_listener("listener").unwrap();
        assert_eq!(database.schema_version(), Some(SchemaVersion::LATEST));
        assert_eq!(database.get_change_listeners().unwrap().len(), 1);
    }

    #[test]
    fn test_status_round_trip() {
        let tmp = TempDir::new().unwrap();
        let database = open(&tmp);
        let set = ConfigurationSet::new("status")
            .with_units(vec![ConfigurationUnit::new("git", "Git/Install")]);
        let unit = set.units[0].instance_identifier;
        database.write_set_history(&set).unwrap();

        let baseline = database.get_status_baseline().unwrap();
        assert_eq!(baseline.change_identifier, 0);

        database.update_set_in_queue(&set.instance_identifier, true).unwrap();
        database.update_set_state(&set.instance_identifier, SetState::InProgress).unwrap();
        let result = ResultInformation::new(codes::E_FAIL, ResultSource::UnitProcessing);
        database
            .update_unit_state(&set.instance_identifier, &unit, UnitState::Completed, Some(&result))
            .unwrap();
        database.update_set_state(&set.instance_identifier, SetState::Completed).unwrap();
        database.update_set_in_queue(&set.instance_identifier, false).unwrap();

        let changes = database.get_status_since(baseline.change_identifier).unwrap();
        // The set row is rewritten in place, so only its latest change remains
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].unit_instance_identifier, Some(unit));
        assert!(changes[1].is_set_status());
        assert!(!changes[1].in_queue);

        assert_eq!(database.get_unit_state(&unit).unwrap(), UnitState::Completed);
        assert_eq!(database.get_unit_result_information(&unit).unwrap(), Some(result));
        assert!(database.get_set_apply_begun(&set.instance_identifier).unwrap().is_some());
        assert!(database.get_set_apply_ended(&set.instance_identifier).unwrap().is_some());
    }

    #[test]
    fn test_shared_between_threads() {
        let tmp = TempDir::new().unwrap();
        let database = std::sync::Arc::new(open(&tmp));
        let sets: Vec<_> = (0..4).map(|i| ConfigurationSet::new(format!("set {i}"))).collect();

        let handles: Vec<_> = sets
            .iter()
            .cloned()
            .map(|set| {
                let database = database.clone();
                std::thread::spawn(move || database.write_set_history(&set).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(database.get_set_history().unwrap().len(), sets.len());
    }
}
