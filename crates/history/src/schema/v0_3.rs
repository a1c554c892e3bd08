//! Schema 0.3: adds change listeners and the status change log
//!
//! Every status mutation stamps its row with the next change identifier, so
//! readers can poll for "everything after N".

use super::v0_1::V0_1;
use super::v0_2::V0_2;
use super::{
    ConfigurationDatabaseSchema, SchemaVersion, time_from_epoch, uuid_from_blob, uuid_to_blob,
    write_version,
};
use crate::error::{Error, Result};
use crate::types::{ChangeListenerItem, QueueItem, StatusBaseline, StatusItem};
use chrono::{DateTime, Utc};
use declarative::{ConfigurationSet, ResultInformation, ResultSource, SetState, UnitState};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct V0_3;

const STATUS_SELECT: &str = "SELECT s.change_identifier, s.change_time_latest, i.instance_identifier,
        s.in_queue, s.unit_instance_identifier, s.state, s.result_code,
        s.result_description, s.result_details, s.result_source
    FROM status_items s LEFT OUTER JOIN set_info i ON s.set_rowid = i.id";

/// Fields of one status mutation; `None` leaves the stored value alone
#[derive(Debug, Default)]
struct StatusUpdate<'a> {
    unit_instance_identifier: Option<&'a Uuid>,
    state: Option<i32>,
    in_queue: Option<bool>,
    result: Option<&'a ResultInformation>,
}

impl V0_3 {
    pub const VERSION: SchemaVersion = SchemaVersion::new(0, 3);

    pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS change_listeners (
                id INTEGER PRIMARY KEY,
                object_name TEXT NOT NULL UNIQUE,
                started INTEGER NOT NULL,
                process_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS status_items (
                id INTEGER PRIMARY KEY,
                change_identifier INTEGER NOT NULL,
                change_time_initial INTEGER NOT NULL,
                change_time_latest INTEGER NOT NULL,
                set_rowid INTEGER NOT NULL,
                in_queue INTEGER NOT NULL DEFAULT 0,
                unit_instance_identifier BLOB,
                state INTEGER NOT NULL DEFAULT 0,
                result_code INTEGER,
                result_description TEXT,
                result_details TEXT,
                result_source INTEGER
            );

            CREATE INDEX IF NOT EXISTS status_items_change_idx ON status_items(change_identifier);
            CREATE INDEX IF NOT EXISTS status_items_set_idx ON status_items(set_rowid);
            CREATE UNIQUE INDEX IF NOT EXISTS status_items_unit_idx
                ON status_items(unit_instance_identifier);",
        )?;
        Ok(())
    }

    fn latest_change_identifier(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(change_identifier), 0) FROM status_items",
            [],
            |row| row.get(0),
        )?)
    }

    /// Update the set's (or unit's) status row, creating it on first use
    fn update_status(
        conn: &Connection,
        set_instance_identifier: &Uuid,
        update: StatusUpdate<'_>,
    ) -> Result<()> {
        let change_identifier = Self::latest_change_identifier(conn)? + 1;
        let change_time = Utc::now().timestamp();
        let set_id = uuid_to_blob(set_instance_identifier);
        let unit_id = update.unit_instance_identifier.map(uuid_to_blob);
        let result = update.result;

        let updated = conn.execute(
            "UPDATE status_items SET
                change_identifier = ?1,
                change_time_latest = ?2,
                state = COALESCE(?3, state),
                in_queue = COALESCE(?4, in_queue),
                result_code = COALESCE(?5, result_code),
                result_description = COALESCE(?6, result_description),
                result_details = COALESCE(?7, result_details),
                result_source = COALESCE(?8, result_source)
             WHERE set_rowid = (SELECT id FROM set_info WHERE instance_identifier = ?9)
               AND unit_instance_identifier IS ?10",
            params![
                change_identifier,
                change_time,
                update.state,
                update.in_queue,
                result.map(|r| r.code),
                result.map(|r| r.description.as_str()),
                result.map(|r| r.details.as_str()),
                result.map(|r| r.source.as_i32()),
                set_id,
                unit_id,
            ],
        )?;

        if updated > 0 {
            return Ok(());
        }

        let inserted = conn.execute(
            "INSERT INTO status_items (
                change_identifier, change_time_initial, change_time_latest, set_rowid, in_queue,
                unit_instance_identifier, state, result_code, result_description, result_details,
                result_source
             )
             SELECT ?1, ?2, ?2, id, COALESCE(?4, 0), ?10, COALESCE(?3, 0), ?5, ?6, ?7, ?8
             FROM set_info WHERE instance_identifier = ?9",
            params![
                change_identifier,
                change_time,
                update.state,
                update.in_queue,
                result.map(|r| r.code),
                result.map(|r| r.description.as_str()),
                result.map(|r| r.details.as_str()),
                result.map(|r| r.source.as_i32()),
                set_id,
                unit_id,
            ],
        )?;

        if inserted == 0 {
            return Err(Error::SetNotFound(*set_instance_identifier));
        }
        Ok(())
    }

    fn read_status_item(row: &Row<'_>) -> rusqlite::Result<StatusItem> {
        let set_id: Vec<u8> = row.get(2)?;
        let unit_id: Option<Vec<u8>> = row.get(4)?;
        let code: Option<i32> = row.get(6)?;

        let result_information = match code {
            Some(code) => Some(ResultInformation {
                code,
                description: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                details: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                source: row
                    .get::<_, Option<i32>>(9)?
                    .map(ResultSource::from_i32)
                    .unwrap_or(ResultSource::None),
            }),
            None => None,
        };

        Ok(StatusItem {
            change_identifier: row.get(0)?,
            change_time: time_from_epoch(row.get(1)?),
            set_instance_identifier: uuid_from_blob(2, &set_id)?,
            in_queue: row.get(3)?,
            unit_instance_identifier: unit_id.map(|id| uuid_from_blob(4, &id)).transpose()?,
            state: row.get(5)?,
            result_information,
        })
    }

    fn set_status_column<T: rusqlite::types::FromSql>(
        conn: &Connection,
        column: &str,
        set_instance_identifier: &Uuid,
    ) -> Result<Option<(T, bool)>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT s.{column}, s.in_queue FROM status_items s
                     JOIN set_info i ON s.set_rowid = i.id
                     WHERE i.instance_identifier = ?1 AND s.unit_instance_identifier IS NULL"
                ),
                [uuid_to_blob(set_instance_identifier)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }
}

impl ConfigurationDatabaseSchema for V0_3 {
    fn version(&self) -> SchemaVersion {
        Self::VERSION
    }

    fn initialize_database(&self, conn: &mut Connection) -> Result<()> {
        let sp = conn.savepoint_with_name("initialize_0_3")?;
        V0_1::create_tables(&sp)?;
        V0_2::create_tables(&sp)?;
        Self::create_tables(&sp)?;
        write_version(&sp, Self::VERSION)?;
        sp.commit()?;
        Ok(())
    }

    fn migrate_from(&self, conn: &mut Connection, from: SchemaVersion) -> Result<()> {
        if from < V0_2::VERSION {
            V0_2.migrate_from(conn, from)?;
        } else if from != V0_2::VERSION {
            return Err(Error::UnsupportedSchemaVersion(from));
        }

        let sp = conn.savepoint_with_name("migrate_0_3")?;
        Self::create_tables(&sp)?;
        write_version(&sp, Self::VERSION)?;
        sp.commit()?;
        Ok(())
    }

    fn add_set(&self, conn: &Connection, set: &ConfigurationSet) -> Result<i64> {
        V0_1.add_set(conn, set)
    }

    fn update_set(&self, conn: &Connection, row_id: i64, set: &ConfigurationSet) -> Result<()> {
        V0_1.update_set(conn, row_id, set)
    }

    fn remove_set(&self, conn: &Connection, row_id: i64) -> Result<()> {
        conn.execute("DELETE FROM status_items WHERE set_rowid = ?1", [row_id])?;
        V0_1.remove_set(conn, row_id)
    }

    fn get_set_row_id(&self, conn: &Connection, instance_identifier: &Uuid) -> Result<Option<i64>> {
        V0_1.get_set_row_id(conn, instance_identifier)
    }

    fn get_sets(&self, conn: &Connection) -> Result<Vec<ConfigurationSet>> {
        V0_1.get_sets(conn)
    }

    fn get_set(
        &self,
        conn: &Connection,
        instance_identifier: &Uuid,
    ) -> Result<Option<ConfigurationSet>> {
        V0_1.get_set(conn, instance_identifier)
    }

    fn get_set_first_apply(
        &self,
        conn: &Connection,
        instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        V0_1.get_set_first_apply(conn, instance_identifier)
    }

    fn add_queue_item(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
        object_name: &str,
        process_id: u32,
    ) -> Result<()> {
        V0_2.add_queue_item(conn, set_instance_identifier, object_name, process_id)
    }

    fn set_active_queue_item(&self, conn: &Connection, object_name: &str) -> Result<()> {
        V0_2.set_active_queue_item(conn, object_name)
    }

    fn get_queue_items(&self, conn: &Connection) -> Result<Vec<QueueItem>> {
        V0_2.get_queue_items(conn)
    }

    fn remove_queue_item(&self, conn: &Connection, object_name: &str) -> Result<()> {
        V0_2.remove_queue_item(conn, object_name)
    }

    fn add_listener(&self, conn: &Connection, object_name: &str, process_id: u32) -> Result<()> {
        conn.execute(
            "INSERT INTO change_listeners (object_name, started, process_id) VALUES (?1, ?2, ?3)",
            params![object_name, Utc::now().timestamp(), i64::from(process_id)],
        )?;
        Ok(())
    }

    fn remove_listener(&self, conn: &Connection, object_name: &str) -> Result<()> {
        conn.execute("DELETE FROM change_listeners WHERE object_name = ?1", [object_name])?;
        Ok(())
    }

    fn get_change_listeners(&self, conn: &Connection) -> Result<Vec<ChangeListenerItem>> {
        let mut stmt =
            conn.prepare("SELECT object_name, started, process_id FROM change_listeners ORDER BY id")?;
        let listeners = stmt
            .query_map([], |row| {
                Ok(ChangeListenerItem {
                    object_name: row.get(0)?,
                    started: time_from_epoch(row.get(1)?),
                    process_id: row.get::<_, i64>(2)? as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(listeners)
    }

    fn update_set_state(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
        state: SetState,
    ) -> Result<()> {
        Self::update_status(
            conn,
            set_instance_identifier,
            StatusUpdate {
                state: Some(state.as_i32()),
                ..Default::default()
            },
        )
    }

    fn update_set_in_queue(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
        in_queue: bool,
    ) -> Result<()> {
        Self::update_status(
            conn,
            set_instance_identifier,
            StatusUpdate {
                in_queue: Some(in_queue),
                ..Default::default()
            },
        )
    }

    fn update_unit_state(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
        unit_instance_identifier: &Uuid,
        state: UnitState,
        result: Option<&ResultInformation>,
    ) -> Result<()> {
        Self::update_status(
            conn,
            set_instance_identifier,
            StatusUpdate {
                unit_instance_identifier: Some(unit_instance_identifier),
                state: Some(state.as_i32()),
                in_queue: None,
                result,
            },
        )
    }

    fn get_set_state(&self, conn: &Connection, set_instance_identifier: &Uuid) -> Result<SetState> {
        Ok(Self::set_status_column::<i32>(conn, "state", set_instance_identifier)?
            .map(|(state, _)| SetState::from_i32(state))
            .unwrap_or(SetState::Unknown))
    }

    fn get_set_apply_begun(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(
            Self::set_status_column::<i64>(conn, "change_time_initial", set_instance_identifier)?
                .map(|(time, _)| time_from_epoch(time)),
        )
    }

    fn get_set_apply_ended(
        &self,
        conn: &Connection,
        set_instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(
            Self::set_status_column::<i64>(conn, "change_time_latest", set_instance_identifier)?
                .filter(|(_, in_queue)| !in_queue)
                .map(|(time, _)| time_from_epoch(time)),
        )
    }

    fn get_unit_state(&self, conn: &Connection, unit_instance_identifier: &Uuid) -> Result<UnitState> {
        let state: Option<i32> = conn
            .query_row(
                "SELECT state FROM status_items WHERE unit_instance_identifier = ?1",
                [uuid_to_blob(unit_instance_identifier)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.map(UnitState::from_i32).unwrap_or(UnitState::Unknown))
    }

    fn get_unit_result_information(
        &self,
        conn: &Connection,
        unit_instance_identifier: &Uuid,
    ) -> Result<Option<ResultInformation>> {
        let mut stmt = conn.prepare(&format!("{STATUS_SELECT} WHERE s.unit_instance_identifier = ?1"))?;
        let item = stmt
            .query_row([uuid_to_blob(unit_instance_identifier)], Self::read_status_item)
            .optional()?;
        Ok(item.and_then(|item| item.result_information))
    }

    fn get_status_since(&self, conn: &Connection, change_identifier: i64) -> Result<Vec<StatusItem>> {
        let mut stmt = conn.prepare(&format!(
            "{STATUS_SELECT} WHERE s.change_identifier > ?1 ORDER BY s.change_identifier"
        ))?;
        let items = stmt
            .query_map([change_identifier], Self::read_status_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn get_status_baseline(&self, conn: &Connection) -> Result<StatusBaseline> {
        let change_identifier = Self::latest_change_identifier(conn)?;
        let mut stmt = conn.prepare(&format!(
            "{STATUS_SELECT} WHERE s.unit_instance_identifier IS NULL ORDER BY s.change_identifier"
        ))?;
        let sets = stmt
            .query_map([], Self::read_status_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(StatusBaseline {
            change_identifier,
            sets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{ConfigurationUnit, codes};
    use tempfile::TempDir;

    fn database() -> (TempDir, Connection) {
        let tmp = TempDir::new().unwrap();
        let mut conn = Connection::open(tmp.path().join("config.db")).unwrap();
        V0_3.initialize_database(&mut conn).unwrap();
        (tmp, conn)
    }

    fn stored_set(conn: &Connection) -> ConfigurationSet {
        let set = ConfigurationSet::new("status")
            .with_units(vec![ConfigurationUnit::new("a", "Res"), ConfigurationUnit::new("b", "Res")]);
        V0_3.add_set(conn, &set).unwrap();
        set
    }

    #[test]
    fn test_status_changes_are_ordered() {
        let (_tmp, conn) = database();
        let set = stored_set(&conn);
        let unit = set.units[0].instance_identifier;

        V0_3.update_set_in_queue(&conn, &set.instance_identifier, true).unwrap();
        V0_3.update_set_state(&conn, &set.instance_identifier, SetState::Pending).unwrap();
        let baseline = V0_3.get_status_baseline(&conn).unwrap();
        assert_eq!(baseline.change_identifier, 2);
        assert_eq!(baseline.sets.len(), 1);
        assert_eq!(baseline.sets[0].set_state(), SetState::Pending);
        assert!(baseline.sets[0].in_queue);

        V0_3.update_set_state(&conn, &set.instance_identifier, SetState::InProgress).unwrap();
        V0_3.update_unit_state(&conn, &set.instance_identifier, &unit, UnitState::InProgress, None)
            .unwrap();

        let changes = V0_3.get_status_since(&conn, baseline.change_identifier).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].is_set_status());
        assert_eq!(changes[0].change_identifier, 3);
        assert_eq!(changes[1].unit_instance_identifier, Some(unit));
        assert_eq!(changes[1].unit_state(), UnitState::InProgress);
        assert_eq!(changes[1].set_instance_identifier, set.instance_identifier);

        assert!(V0_3.get_status_since(&conn, 4).unwrap().is_empty());
    }

    #[test]
    fn test_unit_result_information() {
        let (_tmp, conn) = database();
        let set = stored_set(&conn);
        let unit = set.units[1].instance_identifier;

        V0_3.update_unit_state(&conn, &set.instance_identifier, &unit, UnitState::InProgress, None)
            .unwrap();
        assert_eq!(V0_3.get_unit_result_information(&conn, &unit).unwrap(), None);

        let mut failure = ResultInformation::new(codes::E_FAIL, ResultSource::UnitProcessing);
        failure.description = "install failed".to_string();
        V0_3.update_unit_state(
            &conn,
            &set.instance_identifier,
            &unit,
            UnitState::Completed,
            Some(&failure),
        )
        .unwrap();

        assert_eq!(V0_3.get_unit_state(&conn, &unit).unwrap(), UnitState::Completed);
        assert_eq!(V0_3.get_unit_result_information(&conn, &unit).unwrap(), Some(failure));
        assert_eq!(V0_3.get_unit_state(&conn, &Uuid::new_v4()).unwrap(), UnitState::Unknown);
    }

    #[test]
    fn test_apply_ended_requires_leaving_queue() {
        let (_tmp, conn) = database();
        let set = stored_set(&conn);
        let id = set.instance_identifier;

        V0_3.update_set_in_queue(&conn, &id, true).unwrap();
        V0_3.update_set_state(&conn, &id, SetState::Completed).unwrap();
        assert!(V0_3.get_set_apply_begun(&conn, &id).unwrap().is_some());
        assert_eq!(V0_3.get_set_apply_ended(&conn, &id).unwrap(), None);

        V0_3.update_set_in_queue(&conn, &id, false).unwrap();
        assert!(V0_3.get_set_apply_ended(&conn, &id).unwrap().is_some());
        assert_eq!(V0_3.get_set_state(&conn, &id).unwrap(), SetState::Completed);
    }

    #[test]
    fn test_status_for_unknown_set_fails() {
        let (_tmp, conn) = database();
        let id = Uuid::new_v4();
        assert!(matches!(
            V0_3.update_set_state(&conn, &id, SetState::Pending),
            Err(Error::SetNotFound(missing)) if missing == id
        ));
        assert_eq!(V0_3.get_set_state(&conn, &id).unwrap(), SetState::Unknown);
    }

    #[test]
    fn test_remove_set_clears_status() {
        let (_tmp, conn) = database();
        let set = stored_set(&conn);
        V0_3.update_set_state(&conn, &set.instance_identifier, SetState::Pending).unwrap();
        let row_id = V0_3.get_set_row_id(&conn, &set.instance_identifier).unwrap().unwrap();

        V0_3.remove_set(&conn, row_id).unwrap();

        assert!(V0_3.get_status_baseline(&conn).unwrap().sets.is_empty());
    }

    #[test]
    fn test_listeners() {
        let (_tmp, conn) = database();
        V0_3.add_listener(&conn, "listener_1", 7).unwrap();
        V0_3.add_listener(&conn, "listener_2", 8).unwrap();
        V0_3.remove_listener(&conn, "listener_1").unwrap();

        let listeners = V0_3.get_change_listeners(&conn).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].object_name, "listener_2");
        assert_eq!(listeners[0].process_id, 8);
    }

    #[test]
    fn test_migrate_from_0_1_chains() {
        let tmp = TempDir::new().unwrap();
        let mut conn = Connection::open(tmp.path().join("config.db")).unwrap();
        V0_1.initialize_database(&mut conn).unwrap();
        let set = ConfigurationSet::new("old");
        V0_1.add_set(&conn, &set).unwrap();

        V0_3.migrate_from(&mut conn, V0_1::VERSION).unwrap();

        assert_eq!(super::super::read_version(&conn).unwrap(), Some(V0_3::VERSION));
        V0_3.add_queue_item(&conn, &set.instance_identifier, "q", 1).unwrap();
        V0_3.update_set_state(&conn, &set.instance_identifier, SetState::Pending).unwrap();
        assert_eq!(V0_3.get_set_state(&conn, &set.instance_identifier).unwrap(), SetState::Pending);
    }
}
