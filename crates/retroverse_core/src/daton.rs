use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::{DatonKey, NEW_RECORD_PK};
use crate::schema::{ColType, DatonDef, TableDef};

/// One row: column values plus the rows of each child table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<Row>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row with every column of `table` at its default value
    pub fn with_defaults(table: &TableDef) -> Self {
        let values = table
            .cols
            .iter()
            .map(|c| (c.name.clone(), c.default_value.clone().unwrap_or(Value::Null)))
            .collect();
        Self {
            values,
            children: BTreeMap::new(),
        }
    }

    pub fn with(mut self, col: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(col.into(), value.into());
        self
    }

    pub fn with_children(mut self, table: impl Into<String>, rows: Vec<Row>) -> Self {
        self.children.insert(table.into(), rows);
        self
    }

    pub fn get(&self, col: &str) -> Option<&Value> {
        self.values.get(col)
    }

    pub fn set(&mut self, col: impl Into<String>, value: Value) {
        self.values.insert(col.into(), value);
    }

    /// Primary key of this row rendered the way record keys render it
    pub fn pk_string(&self, table: &TableDef) -> Option<String> {
        self.get(&table.primary_key).and_then(value_key_string)
    }

    pub fn child_rows(&self, table: &str) -> &[Row] {
        self.children.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn child_rows_mut(&mut self, table: &str) -> &mut Vec<Row> {
        self.children.entry(table.to_string()).or_default()
    }
}

/// Render a scalar value as a key segment. Null and structured values have no
/// key form.
pub fn value_key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Locate a row by primary key among `rows`
pub fn find_row_index(rows: &[Row], table: &TableDef, pk: &str) -> Option<usize> {
    rows.iter()
        .position(|r| r.pk_string(table).as_deref() == Some(pk))
}

/// A loaded daton: a tree of rows rooted in the main table.
///
/// Single-row datons hold zero or one row in `rows`; multi-row datons hold
/// the full list.
#[derive(Debug, Clone, PartialEq)]
pub struct Daton {
    pub key: DatonKey,
    /// Assigned by the lock authority; only records carry one
    pub version: Option<String>,
    /// False when a query result was cut off at a page boundary
    pub is_complete_load: bool,
    pub rows: Vec<Row>,
}

impl Daton {
    pub fn new(key: DatonKey) -> Self {
        Self {
            key,
            version: None,
            is_complete_load: true,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Default instance for a new (unsaved) record of `def`
    pub fn new_default(def: &DatonDef) -> Self {
        let mut daton = Self::new(DatonKey::new_record(&def.name));
        if !def.multiple_main_rows {
            let table = &def.main_table;
            let mut row = Row::with_defaults(table);
            let sentinel = match table.pk_col().map(|c| c.col_type) {
                Some(ColType::Int | ColType::Long | ColType::Decimal) => Value::from(-1),
                _ => Value::from(NEW_RECORD_PK),
            };
            row.set(table.primary_key.clone(), sentinel);
            daton.rows.push(row);
        }
        daton
    }

    pub fn main_row(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn main_row_mut(&mut self) -> Option<&mut Row> {
        self.rows.first_mut()
    }

    /// Record key derived from the main row, used after a new record gets
    /// its generated primary key.
    pub fn key_from_main_row(&self, def: &DatonDef) -> Option<DatonKey> {
        if def.multiple_main_rows {
            return Some(self.key.clone());
        }
        let pk = self.main_row()?.pk_string(&def.main_table)?;
        Some(DatonKey::record(&def.name, pk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColDef;

    fn customer_def() -> DatonDef {
        DatonDef::persiston(
            "Customer",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef {
                    default_value: Some(Value::from("NO")),
                    ..ColDef::new("Country", ColType::String)
                }),
        )
    }

    #[test]
    fn test_new_default() {
        let daton = Daton::new_default(&customer_def());
        assert!(daton.key.is_new());
        let row = daton.main_row().unwrap();
        assert_eq!(row.get("CustomerId"), Some(&Value::from(-1)));
        assert_eq!(row.get("Country"), Some(&Value::from("NO")));
        assert_eq!(
            daton.key_from_main_row(&customer_def()),
            Some(DatonKey::record("Customer", "-1"))
        );
    }

    #[test]
    fn test_find_row_by_pk() {
        let table = customer_def().main_table;
        let rows = vec![
            Row::new().with("CustomerId", 1),
            Row::new().with("CustomerId", 2),
        ];
        assert_eq!(find_row_index(&rows, &table, "2"), Some(1));
        assert_eq!(find_row_index(&rows, &table, "3"), None);
    }
}
