//! Hierarchical row diffs for persistons.
//!
//! A diff holds, per table, rows to add (all columns), rows to modify
//! (primary key plus changed columns) and rows to delete (primary key only).
//! Added and modified rows may carry diffs of their child tables.
//!
//! On the wire each bucket is a sibling property of the row or envelope that
//! owns the table: `Sale-new`, `Sale` and `Sale-deleted`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::daton::{Daton, Row, find_row_index, value_key_string};
use crate::error::{Result, RetroError};
use crate::key::DatonKey;
use crate::schema::{DataDictionary, DatonDef, TableDef};

const NEW_SUFFIX: &str = "-new";
const DELETED_SUFFIX: &str = "-deleted";

/// One row of a diff bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffRow {
    pub values: BTreeMap<String, Value>,
    pub children: BTreeMap<String, DiffTable>,
}

impl DiffRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, col: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(col.into(), value.into());
        self
    }

    pub fn with_child(mut self, table: impl Into<String>, diff: DiffTable) -> Self {
        self.children.insert(table.into(), diff);
        self
    }
}

/// The three disjoint row buckets of one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffTable {
    pub new: Vec<DiffRow>,
    pub modified: Vec<DiffRow>,
    pub deleted: Vec<DiffRow>,
}

impl DiffTable {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Outcome of applying a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    NoChanges,
    Changes,
    RecordDeleted,
}

/// Changes to one persiston, computed against `based_on_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistonDiff {
    pub key: DatonKey,
    pub based_on_version: Option<String>,
    pub main: DiffTable,
}

impl PersistonDiff {
    pub fn new(key: DatonKey, based_on_version: Option<String>) -> Self {
        Self {
            key,
            based_on_version,
            main: DiffTable::default(),
        }
    }

    /// Apply this diff to `target` in place.
    ///
    /// A single-row persiston needs exactly one main diff row whose bucket
    /// matches whether `target` is a new record; anything else is an error.
    pub fn apply_to(&self, schema: &DataDictionary, target: &mut Daton) -> Result<ApplyResult> {
        let def = schema
            .find_def_for(&self.key)
            .ok_or_else(|| RetroError::UnknownType(self.key.type_name().to_string()))?;
        let table = &def.main_table;

        if def.multiple_main_rows {
            let changed = apply_table(&self.key, table, &self.main, &mut target.rows)?;
            return Ok(if changed {
                ApplyResult::Changes
            } else {
                ApplyResult::NoChanges
            });
        }

        let main = &self.main;
        if main.new.len() + main.modified.len() + main.deleted.len() != 1 {
            return Err(self.shape_error("expected exactly one main row"));
        }
        let target_is_new = target.key.is_new();
        if !main.deleted.is_empty() {
            if target_is_new {
                return Err(self.shape_error("cannot delete a record that was never saved"));
            }
            return Ok(ApplyResult::RecordDeleted);
        }

        let (diff_row, diff_is_new) = match main.new.first() {
            Some(row) => (row, true),
            None => (&main.modified[0], false),
        };
        if diff_is_new != target_is_new {
            return Err(self.shape_error(if diff_is_new {
                "new row given for an existing record"
            } else {
                "modified row given for a new record"
            }));
        }

        if target.rows.is_empty() {
            if !target_is_new {
                return Err(self.shape_error("record has no main row"));
            }
            target.rows.push(Row::with_defaults(table));
        }
        let row = &mut target.rows[0];
        let mut changed = apply_columns(&self.key, table, diff_row, row, target_is_new)?;
        changed |= apply_children(&self.key, table, diff_row, row)?;

        Ok(if changed || target_is_new {
            ApplyResult::Changes
        } else {
            ApplyResult::NoChanges
        })
    }

    /// Diff that turns `pristine` into `modified`. `pristine` is `None` for a
    /// record that was never saved.
    pub fn compute(def: &DatonDef, pristine: Option<&Daton>, modified: &Daton) -> Self {
        let mut diff = Self::new(
            modified.key.clone(),
            pristine.and_then(|p| p.version.clone()),
        );
        let table = &def.main_table;
        let old_rows = pristine.map(|p| p.rows.as_slice()).unwrap_or(&[]);

        if def.multiple_main_rows {
            diff.main = diff_table(table, old_rows, &modified.rows);
        } else if modified.key.is_new() {
            if let Some(row) = modified.main_row() {
                diff.main.new.push(full_row(table, row));
            }
        } else {
            match (old_rows.first(), modified.main_row()) {
                (Some(old), None) => diff.main.deleted.push(pk_only(table, old)),
                (old, Some(new)) => {
                    let empty = Row::new();
                    diff.main.modified.push(diff_row(table, old.unwrap_or(&empty), new));
                }
                (None, None) => {}
            }
        }
        diff
    }

    /// Decode the wire form using the schema for table nesting
    pub fn from_wire(schema: &DataDictionary, value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| RetroError::Wire("diff must be an object".into()))?;
        let key = obj
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| RetroError::Wire("diff without key".into()))?;
        let key = DatonKey::parse(key)?;
        let based_on_version = match obj.get("version") {
            None | Some(Value::Null) => None,
            Some(Value::String(v)) => Some(v.clone()),
            Some(_) => return Err(RetroError::Wire("version must be a string".into())),
        };
        let def = schema
            .find_def_for(&key)
            .ok_or_else(|| RetroError::UnknownType(key.type_name().to_string()))?;
        let main = read_table(&def.main_table, obj)?;
        Ok(Self {
            key,
            based_on_version,
            main,
        })
    }

    /// Encode in the wire form accepted by [`PersistonDiff::from_wire`]
    pub fn to_wire(&self, def: &DatonDef) -> Value {
        let mut obj = Map::new();
        obj.insert("key".into(), Value::from(self.key.to_string()));
        if let Some(version) = &self.based_on_version {
            obj.insert("version".into(), Value::from(version.clone()));
        }
        write_table_named(&mut obj, &def.main_table.name, &self.main);
        obj.into()
    }

    fn shape_error(&self, reason: &str) -> RetroError {
        RetroError::DiffShape {
            key: self.key.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn shape_error(key: &DatonKey, reason: String) -> RetroError {
    RetroError::DiffShape {
        key: key.to_string(),
        reason,
    }
}

/// Overwrite the diff's columns on `row`; true if any value differed
fn apply_columns(
    key: &DatonKey,
    table: &TableDef,
    diff_row: &DiffRow,
    row: &mut Row,
    include_pk: bool,
) -> Result<bool> {
    let mut changed = false;
    for (col, value) in &diff_row.values {
        if table.find_col(col).is_none() {
            return Err(shape_error(key, format!("unknown column {}.{}", table.name, col)));
        }
        if *col == table.primary_key && !include_pk {
            continue;
        }
        if row.get(col) != Some(value) {
            row.set(col.clone(), value.clone());
            changed = true;
        }
    }
    Ok(changed)
}

fn apply_children(key: &DatonKey, table: &TableDef, diff_row: &DiffRow, row: &mut Row) -> Result<bool> {
    let mut changed = false;
    for (name, child_diff) in &diff_row.children {
        let child = table
            .find_child(name)
            .ok_or_else(|| shape_error(key, format!("unknown child table {}", name)))?;
        changed |= apply_table(key, child, child_diff, row.child_rows_mut(name))?;
    }
    Ok(changed)
}

fn apply_table(key: &DatonKey, table: &TableDef, diff: &DiffTable, rows: &mut Vec<Row>) -> Result<bool> {
    let mut changed = false;

    for diff_row in &diff.new {
        let mut row = Row::new();
        apply_columns(key, table, diff_row, &mut row, true)?;
        apply_children(key, table, diff_row, &mut row)?;
        rows.push(row);
        changed = true;
    }

    for diff_row in &diff.modified {
        let pk = diff_pk(key, table, diff_row)?;
        let idx = find_row_index(rows, table, &pk).ok_or_else(|| {
            shape_error(key, format!("no {} row with key {}", table.name, pk))
        })?;
        let row = &mut rows[idx];
        changed |= apply_columns(key, table, diff_row, row, false)?;
        changed |= apply_children(key, table, diff_row, row)?;
    }

    for diff_row in &diff.deleted {
        let pk = diff_pk(key, table, diff_row)?;
        if let Some(idx) = find_row_index(rows, table, &pk) {
            rows.remove(idx);
            changed = true;
        }
    }

    Ok(changed)
}

fn diff_pk(key: &DatonKey, table: &TableDef, diff_row: &DiffRow) -> Result<String> {
    diff_row
        .values
        .get(&table.primary_key)
        .and_then(value_key_string)
        .ok_or_else(|| shape_error(key, format!("{} row without primary key", table.name)))
}

fn pk_only(table: &TableDef, row: &Row) -> DiffRow {
    let mut out = DiffRow::new();
    if let Some(pk) = row.get(&table.primary_key) {
        out.values.insert(table.primary_key.clone(), pk.clone());
    }
    out
}

fn full_row(table: &TableDef, row: &Row) -> DiffRow {
    let mut out = DiffRow {
        values: row.values.clone(),
        children: BTreeMap::new(),
    };
    for child in &table.children {
        if let Some(rows) = row.children.get(&child.name) {
            let diff = DiffTable {
                new: rows.iter().map(|r| full_row(child, r)).collect(),
                ..DiffTable::default()
            };
            out.children.insert(child.name.clone(), diff);
        }
    }
    out
}

fn diff_row(table: &TableDef, old: &Row, new: &Row) -> DiffRow {
    let mut out = pk_only(table, new);
    for (col, value) in &new.values {
        if *col != table.primary_key && old.get(col) != Some(value) {
            out.values.insert(col.clone(), value.clone());
        }
    }
    for child in &table.children {
        let child_diff = diff_table(child, old.child_rows(&child.name), new.child_rows(&child.name));
        if !child_diff.is_empty() {
            out.children.insert(child.name.clone(), child_diff);
        }
    }
    out
}

fn diff_table(table: &TableDef, old: &[Row], new: &[Row]) -> DiffTable {
    let mut out = DiffTable::default();
    for row in new {
        let existing = row
            .pk_string(table)
            .and_then(|pk| find_row_index(old, table, &pk));
        match existing {
            Some(idx) => {
                let d = diff_row(table, &old[idx], row);
                if d.values.len() > 1 || !d.children.is_empty() {
                    out.modified.push(d);
                }
            }
            None => out.new.push(full_row(table, row)),
        }
    }
    for row in old {
        let still_there = row
            .pk_string(table)
            .and_then(|pk| find_row_index(new, table, &pk))
            .is_some();
        if !still_there {
            out.deleted.push(pk_only(table, row));
        }
    }
    out
}

fn is_child_property(table: &TableDef, prop: &str) -> bool {
    let base = prop
        .strip_suffix(NEW_SUFFIX)
        .or_else(|| prop.strip_suffix(DELETED_SUFFIX))
        .unwrap_or(prop);
    table.find_child(base).is_some()
}

fn read_table(table: &TableDef, owner: &Map<String, Value>) -> Result<DiffTable> {
    let mut out = DiffTable::default();
    for (suffix, bucket) in [
        (NEW_SUFFIX, &mut out.new),
        ("", &mut out.modified),
        (DELETED_SUFFIX, &mut out.deleted),
    ] {
        let prop = format!("{}{}", table.name, suffix);
        let Some(rows) = owner.get(&prop) else {
            continue;
        };
        let rows = rows
            .as_array()
            .ok_or_else(|| RetroError::Wire(format!("{} must be an array", prop)))?;
        for row in rows {
            bucket.push(read_row(table, row)?);
        }
    }
    Ok(out)
}

fn read_row(table: &TableDef, value: &Value) -> Result<DiffRow> {
    let obj = value
        .as_object()
        .ok_or_else(|| RetroError::Wire(format!("{} row must be an object", table.name)))?;
    let mut row = DiffRow::new();
    for (prop, v) in obj {
        if table.find_col(prop).is_some() {
            row.values.insert(prop.clone(), v.clone());
        } else if !is_child_property(table, prop) {
            return Err(RetroError::Wire(format!(
                "unknown property {}.{}",
                table.name, prop
            )));
        }
    }
    for child in &table.children {
        let diff = read_table(child, obj)?;
        if !diff.is_empty() {
            row.children.insert(child.name.clone(), diff);
        }
    }
    Ok(row)
}

fn write_table_named(owner: &mut Map<String, Value>, table: &str, diff: &DiffTable) {
    for (suffix, bucket) in [
        (NEW_SUFFIX, &diff.new),
        ("", &diff.modified),
        (DELETED_SUFFIX, &diff.deleted),
    ] {
        if bucket.is_empty() {
            continue;
        }
        let rows = bucket.iter().map(write_row).collect::<Vec<_>>();
        owner.insert(format!("{}{}", table, suffix), Value::Array(rows));
    }
}

fn write_row(row: &DiffRow) -> Value {
    let mut obj: Map<String, Value> = row
        .values
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (name, child) in &row.children {
        write_table_named(&mut obj, name, child);
    }
    obj.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColDef, ColType};
    use serde_json::json;

    fn customer_def() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef::new("Company", ColType::String))
                .child(
                    TableDef::new("Sale", "SaleId")
                        .col(ColDef::new("SaleId", ColType::Int))
                        .col(ColDef::new("Amount", ColType::Decimal))
                        .child(
                            TableDef::new("SaleNote", "NoteId")
                                .col(ColDef::new("NoteId", ColType::Int))
                                .col(ColDef::new("Text", ColType::String)),
                            "SaleId",
                        ),
                    "CustomerId",
                ),
        )
    }

    fn schema() -> DataDictionary {
        let country = DatonDef::persiston(
            "Country",
            TableDef::new("Country", "Code")
                .col(ColDef::new("Code", ColType::String))
                .col(ColDef::new("Name", ColType::String)),
        )
        .with_multiple_main_rows();
        DataDictionary::new([customer_def(), country])
    }

    fn customer() -> Daton {
        Daton::new(DatonKey::record("Customer", "5"))
            .with_version("v1")
            .with_rows(vec![
                Row::new()
                    .with("CustomerId", 5)
                    .with("Company", "Acme")
                    .with_children(
                        "Sale",
                        vec![
                            Row::new().with("SaleId", 1).with("Amount", 10.0),
                            Row::new()
                                .with("SaleId", 2)
                                .with("Amount", 20.0)
                                .with_children(
                                    "SaleNote",
                                    vec![Row::new().with("NoteId", 7).with("Text", "rush")],
                                ),
                        ],
                    ),
            ])
    }

    #[test]
    fn test_apply_modified_columns_and_children() {
        let schema = schema();
        let mut target = customer();
        let mut diff = PersistonDiff::new(target.key.clone(), Some("v1".into()));
        diff.main.modified.push(
            DiffRow::new()
                .with("CustomerId", 5)
                .with("Company", "Acme Ltd")
                .with_child(
                    "Sale",
                    DiffTable {
                        new: vec![DiffRow::new().with("SaleId", 3).with("Amount", 5.0)],
                        modified: vec![DiffRow::new().with("SaleId", 2).with("Amount", 25.0)],
                        deleted: vec![DiffRow::new().with("SaleId", 1)],
                    },
                ),
        );

        assert_eq!(diff.apply_to(&schema, &mut target).unwrap(), ApplyResult::Changes);
        let row = target.main_row().unwrap();
        assert_eq!(row.get("Company").unwrap(), "Acme Ltd");
        let sales = row.child_rows("Sale");
        assert_eq!(sales.len(), 2);
        assert_eq!(sales[0].get("Amount").unwrap(), &json!(25.0));
        assert_eq!(sales[0].child_rows("SaleNote").len(), 1);
        assert_eq!(sales[1].get("SaleId").unwrap(), &json!(3));
    }

    #[test]
    fn test_apply_same_values_is_no_change() {
        let schema = schema();
        let mut target = customer();
        let mut diff = PersistonDiff::new(target.key.clone(), Some("v1".into()));
        diff.main.modified.push(
            DiffRow::new()
                .with("CustomerId", 5)
                .with("Company", "Acme")
                .with_child(
                    "Sale",
                    DiffTable {
                        modified: vec![DiffRow::new().with("SaleId", 1).with("Amount", 10.0)],
                        ..DiffTable::default()
                    },
                ),
        );
        assert_eq!(diff.apply_to(&schema, &mut target).unwrap(), ApplyResult::NoChanges);
        assert_eq!(target, customer());
    }

    #[test]
    fn test_single_row_shape_rules() {
        let schema = schema();

        let mut deleted = PersistonDiff::new(DatonKey::record("Customer", "5"), Some("v1".into()));
        deleted.main.deleted.push(DiffRow::new().with("CustomerId", 5));
        assert_eq!(
            deleted.apply_to(&schema, &mut customer()).unwrap(),
            ApplyResult::RecordDeleted
        );

        let mut wrong = PersistonDiff::new(DatonKey::record("Customer", "5"), Some("v1".into()));
        wrong.main.new.push(DiffRow::new().with("CustomerId", 5));
        assert!(matches!(
            wrong.apply_to(&schema, &mut customer()),
            Err(RetroError::DiffShape { .. })
        ));

        let empty = PersistonDiff::new(DatonKey::record("Customer", "5"), Some("v1".into()));
        assert!(empty.apply_to(&schema, &mut customer()).is_err());

        let mut new_record = Daton::new_default(&customer_def());
        let mut create = PersistonDiff::new(DatonKey::new_record("Customer"), None);
        create.main.new.push(DiffRow::new().with("CustomerId", -1).with("Company", "Newco"));
        assert_eq!(create.apply_to(&schema, &mut new_record).unwrap(), ApplyResult::Changes);
        assert_eq!(new_record.main_row().unwrap().get("Company").unwrap(), "Newco");

        let mut modify_new = PersistonDiff::new(DatonKey::new_record("Customer"), None);
        modify_new.main.modified.push(DiffRow::new().with("CustomerId", -1));
        assert!(modify_new.apply_to(&schema, &mut Daton::new_default(&customer_def())).is_err());
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let mut diff = PersistonDiff::new(DatonKey::record("Customer", "5"), Some("v1".into()));
        diff.main.modified.push(DiffRow::new().with("CustomerId", 5).with("Bogus", 1));
        assert!(diff.apply_to(&schema(), &mut customer()).is_err());
    }

    #[test]
    fn test_compute_then_apply_reproduces_target() {
        let def = customer_def();
        let pristine = customer();
        let mut modified = customer();
        {
            let row = modified.main_row_mut().unwrap();
            row.set("Company", json!("Acme Ltd"));
            let sales = row.child_rows_mut("Sale");
            sales.remove(0);
            sales[0].child_rows_mut("SaleNote")[0].set("Text", json!("urgent"));
            sales.push(
                Row::new()
                    .with("SaleId", 9)
                    .with("Amount", 1.5)
                    .with_children("SaleNote", vec![Row::new().with("NoteId", 11).with("Text", "new")]),
            );
        }

        let diff = PersistonDiff::compute(&def, Some(&pristine), &modified);
        assert_eq!(diff.based_on_version.as_deref(), Some("v1"));
        let mut applied = pristine.clone();
        assert_eq!(diff.apply_to(&schema(), &mut applied).unwrap(), ApplyResult::Changes);
        assert_eq!(applied.rows, modified.rows);
    }

    #[test]
    fn test_compute_multi_row_table() {
        let schema = schema();
        let def = schema.find_def("Country").unwrap();
        let pristine = Daton::new(DatonKey::whole_table("Country")).with_rows(vec![
            Row::new().with("Code", "NO").with("Name", "Norway"),
            Row::new().with("Code", "SE").with("Name", "Sweden"),
        ]);
        let modified = Daton::new(DatonKey::whole_table("Country")).with_rows(vec![
            Row::new().with("Code", "NO").with("Name", "Noreg"),
            Row::new().with("Code", "DK").with("Name", "Denmark"),
        ]);

        let diff = PersistonDiff::compute(def, Some(&pristine), &modified);
        assert_eq!(diff.main.new.len(), 1);
        assert_eq!(diff.main.modified.len(), 1);
        assert_eq!(diff.main.deleted.len(), 1);

        let mut applied = pristine.clone();
        diff.apply_to(&schema, &mut applied).unwrap();
        assert_eq!(applied.rows, modified.rows);
    }

    #[test]
    fn test_wire_format() {
        let schema = schema();
        let wire = json!({
            "key": "Customer|=5",
            "version": "v1",
            "Customer": [{
                "CustomerId": 5,
                "Company": "Acme Ltd",
                "Sale-new": [{"SaleId": 3, "Amount": 5.0}],
                "Sale-deleted": [{"SaleId": 1}],
                "Sale": [{"SaleId": 2, "SaleNote": [{"NoteId": 7, "Text": "x"}]}]
            }]
        });
        let diff = PersistonDiff::from_wire(&schema, &wire).unwrap();
        assert_eq!(diff.based_on_version.as_deref(), Some("v1"));
        let row = &diff.main.modified[0];
        let sales = &row.children["Sale"];
        assert_eq!(sales.new.len(), 1);
        assert_eq!(sales.deleted.len(), 1);
        assert_eq!(sales.modified[0].children["SaleNote"].modified.len(), 1);

        assert_eq!(diff.to_wire(schema.find_def("Customer").unwrap()), wire);

        let bad = json!({"key": "Customer|=5", "Customer": [{"CustomerId": 5, "Nope": 1}]});
        assert!(matches!(
            PersistonDiff::from_wire(&schema, &bad),
            Err(RetroError::Wire(_))
        ));
    }
}
