//! Condensed daton encoding.
//!
//! `content` maps the main table name to a row (single-row persistons) or a
//! row list. A row is either a named object (`{"Col": v, "Child": [...]}`) or
//! a positional array: columns in schema order followed by one array of child
//! rows per child table in schema order.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::daton::{Daton, Row};
use crate::error::{Result, RetroError};
use crate::key::DatonKey;
use crate::schema::{DataDictionary, DatonDef, TableDef};

/// How rows are written by [`CondensedDaton::from_daton`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    #[default]
    Named,
    Positional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CondensedDaton {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    pub content: Map<String, Value>,
}

impl CondensedDaton {
    pub fn from_daton(def: &DatonDef, daton: &Daton, format: RowFormat) -> Self {
        let table = &def.main_table;
        let mut content = Map::new();
        let single = def.is_persiston && !def.multiple_main_rows;
        if single {
            if let Some(row) = daton.main_row() {
                content.insert(table.name.clone(), encode_row(table, row, format));
            }
        } else {
            content.insert(table.name.clone(), encode_rows(table, &daton.rows, format));
        }
        Self {
            key: daton.key.to_string(),
            version: daton.version.clone(),
            is_complete: (!daton.key.is_record()).then_some(daton.is_complete_load),
            content,
        }
    }

    /// Decode into a daton tree; named and positional rows may be mixed
    pub fn to_daton(&self, schema: &DataDictionary) -> Result<Daton> {
        let key = DatonKey::parse(&self.key)?;
        let def = schema
            .find_def_for(&key)
            .ok_or_else(|| RetroError::UnknownType(key.type_name().to_string()))?;
        let table = &def.main_table;

        let rows = match self.content.get(&table.name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) if def.multiple_main_rows || !def.is_persiston => items
                .iter()
                .map(|item| decode_row(table, item))
                .collect::<Result<_>>()?,
            Some(row) => vec![decode_row(table, row)?],
        };

        let mut daton = Daton::new(key).with_rows(rows);
        daton.version = self.version.clone();
        daton.is_complete_load = self.is_complete.unwrap_or(true);
        Ok(daton)
    }
}

fn encode_rows(table: &TableDef, rows: &[Row], format: RowFormat) -> Value {
    Value::Array(rows.iter().map(|r| encode_row(table, r, format)).collect())
}

fn encode_row(table: &TableDef, row: &Row, format: RowFormat) -> Value {
    match format {
        RowFormat::Named => {
            let mut obj = Map::new();
            for col in &table.cols {
                if let Some(value) = row.get(&col.name) {
                    obj.insert(col.name.clone(), value.clone());
                }
            }
            for child in &table.children {
                let rows = row.child_rows(&child.name);
                if !rows.is_empty() {
                    obj.insert(child.name.clone(), encode_rows(child, rows, format));
                }
            }
            Value::Object(obj)
        }
        RowFormat::Positional => {
            let mut items: Vec<Value> = table
                .cols
                .iter()
                .map(|col| row.get(&col.name).cloned().unwrap_or(Value::Null))
                .collect();
            items.extend(
                table
                    .children
                    .iter()
                    .map(|child| encode_rows(child, row.child_rows(&child.name), format)),
            );
            Value::Array(items)
        }
    }
}

fn decode_child_rows(child: &TableDef, value: &Value) -> Result<Vec<Row>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(|item| decode_row(child, item)).collect(),
        _ => Err(RetroError::Wire(format!("{} rows must be an array", child.name))),
    }
}

fn decode_row(table: &TableDef, value: &Value) -> Result<Row> {
    let mut row = Row::new();
    match value {
        Value::Object(obj) => {
            for (name, value) in obj {
                if table.find_col(name).is_some() {
                    row.set(name.clone(), value.clone());
                } else if let Some(child) = table.find_child(name) {
                    let rows = decode_child_rows(child, value)?;
                    if !rows.is_empty() {
                        row.children.insert(child.name.clone(), rows);
                    }
                } else {
                    return Err(RetroError::Wire(format!("{} has no column {}", table.name, name)));
                }
            }
        }
        Value::Array(items) => {
            let expected = table.cols.len() + table.children.len();
            if items.len() != expected {
                return Err(RetroError::Wire(format!(
                    "{} row has {} values, expected {}",
                    table.name,
                    items.len(),
                    expected
                )));
            }
            let (values, children) = items.split_at(table.cols.len());
            for (col, value) in table.cols.iter().zip(values) {
                row.set(col.name.clone(), value.clone());
            }
            for (child, value) in table.children.iter().zip(children) {
                let rows = decode_child_rows(child, value)?;
                if !rows.is_empty() {
                    row.children.insert(child.name.clone(), rows);
                }
            }
        }
        _ => return Err(RetroError::Wire(format!("{} row must be an object or array", table.name))),
    }
    Ok(row)
}
