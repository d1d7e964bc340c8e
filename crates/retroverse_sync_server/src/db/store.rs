//! SQLite data stores, one database file per database number.
//!
//! Each stored record is a single row holding its row tree as JSON. Viewons
//! are answered by filtering the main rows of records sharing the viewon's
//! main table name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use retroverse_core::data::{assign_new_pks, query_rows};
use retroverse_core::{
    DataService, DataTransaction, Daton, DatonDef, DatonKey, PersistonDiff, RetroError, Row, TableDef, User,
};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::schema::init_data_store;

type Result<T> = retroverse_core::Result<T>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FIRST_GENERATED_ID: i64 = 1000;

/// Data service backed by SQLite files under a directory
pub struct SqliteDataService {
    data_dir: PathBuf,
    readers: Mutex<HashMap<u32, Arc<Mutex<Connection>>>>,
}

impl SqliteDataService {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the store holding `database_number`
    pub fn database_path(&self, database_number: u32) -> PathBuf {
        self.data_dir.join(format!("data_{}.db", database_number))
    }

    fn open(&self, database_number: u32) -> Result<Connection> {
        let conn = Connection::open(self.database_path(database_number))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_data_store(&conn)?;
        Ok(conn)
    }

    fn reader(&self, database_number: u32) -> Result<Arc<Mutex<Connection>>> {
        let mut readers = self.readers.lock();
        if let Some(conn) = readers.get(&database_number) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Mutex::new(self.open(database_number)?));
        readers.insert(database_number, conn.clone());
        Ok(conn)
    }
}

fn rows_from_json(text: &str) -> Result<Vec<Row>> {
    Ok(serde_json::from_str(text)?)
}

#[async_trait]
impl DataService for SqliteDataService {
    async fn load(&self, def: &DatonDef, key: &DatonKey, page_size: usize) -> Result<Option<Daton>> {
        let reader = self.reader(def.database_number)?;
        let conn = reader.lock();

        if key.is_record() {
            let content: Option<String> = conn
                .query_row(
                    "SELECT content FROM datons WHERE daton_key = ?",
                    [key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            return match content {
                Some(text) => Ok(Some(Daton::new(key.clone()).with_rows(rows_from_json(&text)?))),
                None => Ok(None),
            };
        }

        let mut stmt = conn.prepare("SELECT content FROM datons WHERE main_table = ? ORDER BY daton_key")?;
        let contents = stmt
            .query_map([&def.main_table.name], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut candidates = Vec::new();
        for text in contents {
            candidates.extend(rows_from_json(&text)?);
        }

        let (rows, complete) = query_rows(def, key, candidates, page_size);
        debug!("Query {} matched {} rows (complete: {})", key, rows.len(), complete);
        let mut daton = Daton::new(key.clone()).with_rows(rows);
        daton.is_complete_load = complete;
        Ok(Some(daton))
    }

    async fn begin(&self, database_number: u32) -> Result<Box<dyn DataTransaction>> {
        let conn = self.open(database_number)?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            database_number,
        }))
    }
}

struct SqliteTransaction {
    conn: Connection,
    database_number: u32,
}

impl SqliteTransaction {
    fn next_id(&self, table: &TableDef) -> Result<i64> {
        Ok(self.conn.query_row(
            "INSERT INTO id_sequence (table_name, next_id) VALUES (?, ?)
             ON CONFLICT(table_name) DO UPDATE SET next_id = next_id + 1
             RETURNING next_id",
            params![table.name, FIRST_GENERATED_ID],
            |row| row.get(0),
        )?)
    }
}

#[async_trait]
impl DataTransaction for SqliteTransaction {
    async fn save(
        &mut self,
        _user: &User,
        def: &DatonDef,
        _pristine: Option<&Daton>,
        modified: &mut Daton,
        diff: &PersistonDiff,
    ) -> Result<()> {
        if def.database_number != self.database_number {
            return Err(RetroError::Data(format!(
                "{} belongs to database {}, not {}",
                def.name, def.database_number, self.database_number
            )));
        }

        if !def.multiple_main_rows && !diff.main.deleted.is_empty() {
            self.conn
                .execute("DELETE FROM datons WHERE daton_key = ?", [modified.key.as_str()])?;
            debug!("Deleted {}", modified.key);
            return Ok(());
        }

        assign_new_pks(&def.main_table, &mut modified.rows, &mut |table: &TableDef| self.next_id(table))?;

        if modified.key.is_new() {
            modified.key = modified
                .key_from_main_row(def)
                .ok_or_else(|| RetroError::Data(format!("new {} has no primary key", def.name)))?;
        }

        let content = serde_json::to_string(&modified.rows)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO datons (daton_key, type_name, main_table, content, updated_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                modified.key.as_str(),
                def.name,
                def.main_table.name,
                content,
                Utc::now().timestamp()
            ],
        )?;
        debug!("Stored {}", modified.key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
