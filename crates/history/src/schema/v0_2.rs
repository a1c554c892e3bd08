//! Schema 0.2: adds the apply queue

use super::v0_1::V0_1;
use super::{
    ConfigurationDatabaseSchema, SchemaVersion, time_from_epoch, uuid_from_blob, uuid_to_blob,
    write_version,
};
use crate::error::{Error, Result};
use crate::types::QueueItem;
use chrono::{DateTime, Utc};
use declarative::ConfigurationSet;
use rusqlite::{Connection, params};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct V0_2;

impl V0_2 {
    pub const VERSION: SchemaVersion = SchemaVersion::new(0, 2);

    pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY,
                set_instance_identifier BLOB NOT NULL,
                object_name TEXT NOT NULL UNIQUE,
                queued_at INTEGER NOT NULL,
                process_id INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }
}

impl ConfigurationDatabaseSchema for V0_2 {
    fn version(&self) -> SchemaVersion {
        Self::VERSION
    }

    fn initialize_database(&self, conn: &mut Connection) -> Result<()> {
        let sp = conn.savepoint_with_name("initialize_0_2")?;
        V0_1::create_tables(&sp)?;
        Self::create_tables(&sp)?;
        write_version(&sp, Self::VERSION)?;
        sp.commit()?;
        Ok(())
    }

    fn migrate_from(&self, conn: &mut Connection, from: SchemaVersion) -> Result<()> {
        if from != V0_1::VERSION {
            return Err(Error::UnsupportedSchemaVersion(from));
        }
        let sp = conn.savepoint_with_name("migrate_0_2")?;
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
        conn.execute(
            "INSERT INTO queue (set_instance_identifier, object_name, queued_at, process_id, active)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                uuid_to_blob(set_instance_identifier),
                object_name,
                Utc::now().timestamp(),
                i64::from(process_id),
            ],
        )?;
        Ok(())
    }

    fn set_active_queue_item(&self, conn: &Connection, object_name: &str) -> Result<()> {
        conn.execute("UPDATE queue SET active = 1 WHERE object_name = ?1", [object_name])?;
        Ok(())
    }

    fn get_queue_items(&self, conn: &Connection) -> Result<Vec<QueueItem>> {
        let mut stmt = conn.prepare(
            "SELECT set_instance_identifier, object_name, queued_at, process_id, active
             FROM queue ORDER BY id",
        )?;
        let items = stmt
            .query_map([], |row| {
                let set_id: Vec<u8> = row.get(0)?;
                Ok(QueueItem {
                    set_instance_identifier: uuid_from_blob(0, &set_id)?,
                    object_name: row.get(1)?,
                    queued_at: time_from_epoch(row.get(2)?),
                    process_id: row.get::<_, i64>(3)? as u32,
                    active: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn remove_queue_item(&self, conn: &Connection, object_name: &str) -> Result<()> {
        conn.execute("DELETE FROM queue WHERE object_name = ?1", [object_name])?;
        Ok(())
    }
}
