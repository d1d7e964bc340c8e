//! Load/save contract with the relational layer.
//!
//! The engine never builds SQL. It asks a [`DataService`] to load datons and
//! to open one [`DataTransaction`] per backing store taking part in a save.

mod memory;
mod query;

pub use memory::MemoryDataService;
pub use query::{compare_values, query_rows};

use async_trait::async_trait;
use serde_json::Value;

use crate::daton::{Daton, Row};
use crate::diff::PersistonDiff;
use crate::error::Result;
use crate::key::{DatonKey, NEW_RECORD_PK};
use crate::permissions::User;
use crate::schema::{ColType, DatonDef, TableDef};

#[async_trait]
pub trait DataService: Send + Sync {
    /// Load a daton. Query keys return at most `page_size` main rows and
    /// clear `is_complete_load` when more exist. Versions are not set here.
    async fn load(&self, def: &DatonDef, key: &DatonKey, page_size: usize) -> Result<Option<Daton>>;

    /// Open a transaction on the backing store numbered `database_number`
    async fn begin(&self, database_number: u32) -> Result<Box<dyn DataTransaction>>;

    /// Fill in a freshly constructed new record
    fn initialize_new(&self, _def: &DatonDef, _daton: &mut Daton, _user: Option<&User>) {}
}

#[async_trait]
pub trait DataTransaction: Send {
    /// Persist one record. For a new record the implementation assigns the
    /// primary key and updates `modified.key` to the saved record's key.
    async fn save(
        &mut self,
        user: &User,
        def: &DatonDef,
        pristine: Option<&Daton>,
        modified: &mut Daton,
        diff: &PersistonDiff,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Whether a primary key value still marks an unsaved row
pub fn is_placeholder_pk(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Number(n)) => n.as_i64() == Some(-1),
        Some(Value::String(s)) => s == NEW_RECORD_PK,
        Some(_) => false,
    }
}

/// Give every row of `table` (and its child tables) whose primary key is a
/// placeholder a generated one taken from `next_id`
pub fn assign_new_pks(
    table: &TableDef,
    rows: &mut [Row],
    next_id: &mut dyn FnMut(&TableDef) -> Result<i64>,
) -> Result<()> {
    for row in rows {
        if is_placeholder_pk(row.get(&table.primary_key)) {
            let id = next_id(table)?;
            let value = match table.pk_col().map(|c| c.col_type) {
                Some(ColType::String) | None => Value::from(id.to_string()),
                Some(_) => Value::from(id),
            };
            row.set(table.primary_key.clone(), value);
        }
        for child in &table.children {
            if let Some(child_rows) = row.children.get_mut(&child.name) {
                assign_new_pks(child, child_rows, next_id)?;
            }
        }
    }
    Ok(())
}
