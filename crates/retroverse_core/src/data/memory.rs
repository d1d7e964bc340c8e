//! In-memory data service for tests and embedding.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::query::query_rows;
use super::{DataService, DataTransaction, assign_new_pks};
use crate::daton::{Daton, Row};
use crate::diff::PersistonDiff;
use crate::error::{Result, RetroError};
use crate::key::DatonKey;
use crate::permissions::User;
use crate::schema::{DatonDef, TableDef};

struct StoredRecord {
    main_table: String,
    daton: Daton,
}

enum Staged {
    Put { table: String, daton: Daton },
    Delete(String),
}

#[derive(Default)]
struct Inner {
    /// database number -> record key -> record
    databases: Mutex<HashMap<u32, BTreeMap<String, StoredRecord>>>,
    next_id: AtomicI64,
    failing_types: Mutex<HashSet<String>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Data service keeping every backing store in process memory.
///
/// Writes are staged per transaction and only become visible on commit.
/// Viewons are answered from the main rows of stored persistons whose main
/// table has the same name.
#[derive(Clone, Default)]
pub struct MemoryDataService {
    inner: Arc<Inner>,
}

impl MemoryDataService {
    pub fn new() -> Self {
        let service = Self::default();
        service.inner.next_id.store(1000, Ordering::SeqCst);
        service
    }

    /// Store a record directly, bypassing transactions
    pub fn insert(&self, def: &DatonDef, mut daton: Daton) {
        daton.version = None;
        self.inner
            .databases
            .lock()
            .entry(def.database_number)
            .or_default()
            .insert(
                daton.key.to_string(),
                StoredRecord {
                    main_table: def.main_table.name.clone(),
                    daton,
                },
            );
    }

    /// Stored copy of a record, ignoring the schema
    pub fn stored(&self, database_number: u32, key: &DatonKey) -> Option<Daton> {
        self.inner
            .databases
            .lock()
            .get(&database_number)
            .and_then(|db| db.get(key.as_str()))
            .map(|r| r.daton.clone())
    }

    /// Make every later save of `type_name` fail
    pub fn fail_saves_of(&self, type_name: impl Into<String>) {
        self.inner.failing_types.lock().insert(type_name.into());
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn load(&self, def: &DatonDef, key: &DatonKey, page_size: usize) -> Result<Option<Daton>> {
        let databases = self.inner.databases.lock();
        let Some(db) = databases.get(&def.database_number) else {
            return Ok(if key.is_record() {
                None
            } else {
                Some(Daton::new(key.clone()))
            });
        };

        if key.is_record() {
            return Ok(db.get(key.as_str()).map(|r| r.daton.clone()));
        }

        let candidates: Vec<Row> = db
            .values()
            .filter(|r| r.main_table == def.main_table.name)
            .flat_map(|r| r.daton.rows.iter().cloned())
            .collect();
        let (rows, complete) = query_rows(def, key, candidates, page_size);
        let mut daton = Daton::new(key.clone()).with_rows(rows);
        daton.is_complete_load = complete;
        Ok(Some(daton))
    }

    async fn begin(&self, database_number: u32) -> Result<Box<dyn DataTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            database_number,
            staged: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    database_number: u32,
    staged: Vec<Staged>,
}

#[async_trait]
impl DataTransaction for MemoryTransaction {
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
        if self.inner.failing_types.lock().contains(&def.name) {
            return Err(RetroError::Data(format!("simulated failure saving {}", def.name)));
        }

        if !def.multiple_main_rows && !diff.main.deleted.is_empty() {
            self.staged.push(Staged::Delete(modified.key.to_string()));
            return Ok(());
        }

        let next_id = &self.inner.next_id;
        assign_new_pks(&def.main_table, &mut modified.rows, &mut |_: &TableDef| {
            Ok::<_, RetroError>(next_id.fetch_add(1, Ordering::SeqCst))
        })?;
        if modified.key.is_new() {
            modified.key = modified
                .key_from_main_row(def)
                .ok_or_else(|| RetroError::Data(format!("new {} has no primary key", def.name)))?;
        }
        let mut stored = modified.clone();
        stored.version = None;
        self.staged.push(Staged::Put {
            table: def.main_table.name.clone(),
            daton: stored,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut databases = self.inner.databases.lock();
        let db = databases.entry(self.database_number).or_default();
        for staged in self.staged {
            match staged {
                Staged::Put { table, daton } => {
                    db.insert(
                        daton.key.to_string(),
                        StoredRecord {
                            main_table: table,
                            daton,
                        },
                    );
                }
                Staged::Delete(key) => {
                    db.remove(&key);
                }
            }
        }
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColDef, ColType};
    use serde_json::Value;

    fn customer_def() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef::new("Company", ColType::String)),
        )
    }

    fn list_def() -> DatonDef {
        DatonDef::viewon(
            "CustomerList",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef::new("Company", ColType::String)),
        )
    }

    #[tokio::test]
    async fn test_new_record_gets_key_on_save() {
        let data = MemoryDataService::new();
        let def = customer_def();
        let mut daton = Daton::new_default(&def);
        daton.rows[0].set("Company", Value::from("Acme"));
        let diff = PersistonDiff::compute(&def, None, &daton);

        let mut tx = data.begin(0).await.unwrap();
        tx.save(&User::new("u"), &def, None, &mut daton, &diff).await.unwrap();
        tx.commit().await.unwrap();

        assert!(!daton.key.is_new());
        let loaded = data.load(&def, &daton.key, 10).await.unwrap().unwrap();
        assert_eq!(loaded.rows[0].get("Company").unwrap(), "Acme");
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let data = MemoryDataService::new();
        let def = customer_def();
        let key = DatonKey::record("Customer", "1");
        let mut daton = Daton::new(key.clone()).with_rows(vec![Row::new().with("CustomerId", 1)]);
        let diff = PersistonDiff::compute(&def, None, &daton);

        let mut tx = data.begin(0).await.unwrap();
        tx.save(&User::new("u"), &def, None, &mut daton, &diff).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(data.stored(0, &key).is_none());
        assert_eq!(data.rollback_count(), 1);
        assert_eq!(data.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_viewon_reads_persiston_rows() {
        let data = MemoryDataService::new();
        let def = customer_def();
        for (id, company) in [(1, "Acme"), (2, "Beta")] {
            data.insert(
                &def,
                Daton::new(DatonKey::record("Customer", id.to_string()))
                    .with_rows(vec![Row::new().with("CustomerId", id).with("Company", company)]),
            );
        }
        let key = DatonKey::query("CustomerList", [("Company", "Beta")], None, None).unwrap();
        let list = data.load(&list_def(), &key, 10).await.unwrap().unwrap();
        assert_eq!(list.rows.len(), 1);
        assert!(list.is_complete_load);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let data = MemoryDataService::new();
        let def = customer_def();
        data.fail_saves_of("Customer");
        let mut daton = Daton::new_default(&def);
        let diff = PersistonDiff::compute(&def, None, &daton);
        let mut tx = data.begin(0).await.unwrap();
        assert!(tx.save(&User::new("u"), &def, None, &mut daton, &diff).await.is_err());
    }
}
