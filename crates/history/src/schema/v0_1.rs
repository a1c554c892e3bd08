//! Schema 0.1: set and unit history

use super::{
    ConfigurationDatabaseSchema, SchemaVersion, time_from_epoch, uuid_from_blob, uuid_to_blob,
    write_version,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use declarative::{ConfigurationSet, ConfigurationUnit, Intent, UnitKind};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct V0_1;

impl V0_1 {
    pub const VERSION: SchemaVersion = SchemaVersion::new(0, 1);

    pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS set_info (
                id INTEGER PRIMARY KEY,
                instance_identifier BLOB NOT NULL UNIQUE,
                name TEXT NOT NULL,
                origin TEXT NOT NULL,
                path TEXT NOT NULL,
                first_apply INTEGER,
                schema_version TEXT NOT NULL,
                metadata TEXT NOT NULL,
                parameters TEXT NOT NULL,
                variables TEXT NOT NULL,
                environment TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS unit_info (
                id INTEGER PRIMARY KEY,
                set_rowid INTEGER NOT NULL REFERENCES set_info(id) ON DELETE CASCADE,
                parent_rowid INTEGER,
                instance_identifier BLOB NOT NULL,
                type TEXT NOT NULL,
                identifier TEXT NOT NULL,
                intent INTEGER NOT NULL,
                dependencies TEXT NOT NULL,
                metadata TEXT NOT NULL,
                settings TEXT NOT NULL,
                environment TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                is_group INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_unit_info_set ON unit_info(set_rowid);",
        )?;
        Ok(())
    }

    fn insert_units(
        conn: &Connection,
        set_row_id: i64,
        parent_row_id: Option<i64>,
        units: &[ConfigurationUnit],
    ) -> Result<()> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO unit_info (
                set_rowid, parent_rowid, instance_identifier, type, identifier, intent,
                dependencies, metadata, settings, environment, is_active, is_group
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;

        for unit in units {
            stmt.execute(params![
                set_row_id,
                parent_row_id,
                uuid_to_blob(&unit.instance_identifier),
                unit.unit_type,
                unit.identifier,
                unit.intent.as_i32(),
                serde_json::to_string(&unit.dependencies)?,
                serde_json::to_string(&unit.metadata)?,
                serde_json::to_string(&unit.settings)?,
                serde_json::to_string(&unit.environment)?,
                unit.is_active,
                unit.is_group(),
            ])?;
            let row_id = conn.last_insert_rowid();
            Self::insert_units(conn, set_row_id, Some(row_id), unit.units())?;
        }
        Ok(())
    }

    fn read_units(conn: &Connection, set_row_id: i64) -> Result<Vec<ConfigurationUnit>> {
        struct StoredUnit {
            row_id: i64,
            parent_row_id: Option<i64>,
            unit: ConfigurationUnit,
        }

        let mut stmt = conn.prepare_cached(
            "SELECT id, parent_rowid, instance_identifier, type, identifier, intent,
                    dependencies, metadata, settings, environment, is_active, is_group
             FROM unit_info WHERE set_rowid = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map([set_row_id], |row| {
            let instance_identifier: Vec<u8> = row.get(2)?;
            let mut unit = ConfigurationUnit::new(row.get::<_, String>(4)?, row.get::<_, String>(3)?);
            unit.instance_identifier = uuid_from_blob(2, &instance_identifier)?;
            unit.intent = Intent::from_i32(row.get(5)?);
            unit.dependencies = json_column(row, 6)?;
            unit.metadata = json_column(row, 7)?;
            unit.settings = json_column(row, 8)?;
            unit.environment = json_column(row, 9)?;
            unit.is_active = row.get(10)?;
            if row.get::<_, bool>(11)? {
                unit.kind = UnitKind::Group { units: Vec::new() };
            }
            Ok(StoredUnit {
                row_id: row.get(0)?,
                parent_row_id: row.get(1)?,
                unit,
            })
        })?;

        let stored = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        // Rows are in insertion order, so siblings keep their declared order
        let mut children: HashMap<Option<i64>, Vec<usize>> = HashMap::new();
        for (index, entry) in stored.iter().enumerate() {
            children.entry(entry.parent_row_id).or_default().push(index);
        }

        fn build(
            parent: Option<i64>,
            stored: &[StoredUnit],
            children: &HashMap<Option<i64>, Vec<usize>>,
        ) -> Vec<ConfigurationUnit> {
            let Some(indices) = children.get(&parent) else {
                return Vec::new();
            };
            indices
                .iter()
                .map(|&index| {
                    let entry = &stored[index];
                    let mut unit = entry.unit.clone();
                    if unit.is_group() {
                        unit.kind = UnitKind::Group {
                            units: build(Some(entry.row_id), stored, children),
                        };
                    }
                    unit
                })
                .collect()
        }

        Ok(build(None, &stored, &children))
    }

    fn read_set(conn: &Connection, row: &Row<'_>) -> Result<ConfigurationSet> {
        let row_id: i64 = row.get(0)?;
        let instance_identifier: Vec<u8> = row.get(1)?;
        let first_apply: Option<i64> = row.get(5)?;

        let mut set = ConfigurationSet::new(row.get::<_, String>(2)?);
        set.instance_identifier = uuid_from_blob(1, &instance_identifier)?;
        set.origin = row.get(3)?;
        set.path = row.get(4)?;
        set.first_apply = first_apply.map(time_from_epoch);
        set.schema_version = row.get(6)?;
        set.metadata = json_column(row, 7)?;
        set.parameters = json_column(row, 8)?;
        set.variables = json_column(row, 9)?;
        set.environment = json_column(row, 10)?;
        set.units = Self::read_units(conn, row_id)?;
        Ok(set)
    }
}

const SET_COLUMNS: &str = "id, instance_identifier, name, origin, path, first_apply,
    schema_version, metadata, parameters, variables, environment";

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, column: usize) -> rusqlite::Result<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl ConfigurationDatabaseSchema for V0_1 {
    fn version(&self) -> SchemaVersion {
        Self::VERSION
    }

    fn initialize_database(&self, conn: &mut Connection) -> Result<()> {
        let sp = conn.savepoint_with_name("initialize_0_1")?;
        Self::create_tables(&sp)?;
        write_version(&sp, Self::VERSION)?;
        sp.commit()?;
        Ok(())
    }

    fn migrate_from(&self, _conn: &mut Connection, from: SchemaVersion) -> Result<()> {
        // Nothing precedes 0.1
        Err(crate::error::Error::UnsupportedSchemaVersion(from))
    }

    fn add_set(&self, conn: &Connection, set: &ConfigurationSet) -> Result<i64> {
        let first_apply = set.first_apply.unwrap_or_else(Utc::now);
        conn.execute(
            "INSERT INTO set_info (
                instance_identifier, name, origin, path, first_apply, schema_version,
                metadata, parameters, variables, environment
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                uuid_to_blob(&set.instance_identifier),
                set.name,
                set.origin,
                set.path,
                first_apply.timestamp(),
                set.schema_version,
                serde_json::to_string(&set.metadata)?,
                serde_json::to_string(&set.parameters)?,
                serde_json::to_string(&set.variables)?,
                serde_json::to_string(&set.environment)?,
            ],
        )?;
        let row_id = conn.last_insert_rowid();
        Self::insert_units(conn, row_id, None, &set.units)?;
        Ok(row_id)
    }

    fn update_set(&self, conn: &Connection, row_id: i64, set: &ConfigurationSet) -> Result<()> {
        conn.execute(
            "UPDATE set_info SET
                name = ?2, origin = ?3, path = ?4, first_apply = COALESCE(first_apply, ?5),
                schema_version = ?6, metadata = ?7, parameters = ?8, variables = ?9,
                environment = ?10
             WHERE id = ?1",
            params![
                row_id,
                set.name,
                set.origin,
                set.path,
                set.first_apply.unwrap_or_else(Utc::now).timestamp(),
                set.schema_version,
                serde_json::to_string(&set.metadata)?,
                serde_json::to_string(&set.parameters)?,
                serde_json::to_string(&set.variables)?,
                serde_json::to_string(&set.environment)?,
            ],
        )?;
        conn.execute("DELETE FROM unit_info WHERE set_rowid = ?1", [row_id])?;
        Self::insert_units(conn, row_id, None, &set.units)?;
        Ok(())
    }

    fn remove_set(&self, conn: &Connection, row_id: i64) -> Result<()> {
        conn.execute("DELETE FROM unit_info WHERE set_rowid = ?1", [row_id])?;
        conn.execute("DELETE FROM set_info WHERE id = ?1", [row_id])?;
        Ok(())
    }

    fn get_set_row_id(&self, conn: &Connection, instance_identifier: &Uuid) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT id FROM set_info WHERE instance_identifier = ?1",
                [uuid_to_blob(instance_identifier)],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn get_sets(&self, conn: &Connection) -> Result<Vec<ConfigurationSet>> {
        let mut stmt = conn.prepare(&format!("SELECT {SET_COLUMNS} FROM set_info ORDER BY id"))?;
        let mut rows = stmt.query([])?;
        let mut sets = Vec::new();
        while let Some(row) = rows.next()? {
            sets.push(Self::read_set(conn, row)?);
        }
        Ok(sets)
    }

    fn get_set(
        &self,
        conn: &Connection,
        instance_identifier: &Uuid,
    ) -> Result<Option<ConfigurationSet>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SET_COLUMNS} FROM set_info WHERE instance_identifier = ?1"
        ))?;
        let mut rows = stmt.query([uuid_to_blob(instance_identifier)])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::read_set(conn, row)?)),
            None => Ok(None),
        }
    }

    fn get_set_first_apply(
        &self,
        conn: &Connection,
        instance_identifier: &Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let first_apply: Option<Option<i64>> = conn
            .query_row(
                "SELECT first_apply FROM set_info WHERE instance_identifier = ?1",
                [uuid_to_blob(instance_identifier)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(first_apply.flatten().map(time_from_epoch))
    }
}
