//! Static schema catalog.
//!
//! The catalog is plain data, built once (typically deserialized from JSON)
//! and shared immutably. Nothing in the engine inspects types at runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::DatonKey;

/// Column storage type, used for validation and for building defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ColType {
    Bool,
    Int,
    Long,
    Decimal,
    String,
    Date,
    DateTime,
    Blob,
}

impl ColType {
    /// Whether a JSON value is acceptable for this column type (null excluded)
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ColType::Bool => value.is_boolean(),
            ColType::Int | ColType::Long => value.is_i64() || value.is_u64(),
            ColType::Decimal => value.is_number(),
            ColType::String | ColType::Date | ColType::DateTime | ColType::Blob => {
                value.is_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColDef {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColType,
    #[serde(default = "default_true")]
    pub allow_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Value given to this column in a freshly constructed row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

fn default_true() -> bool {
    true
}

impl ColDef {
    pub fn new(name: impl Into<String>, col_type: ColType) -> Self {
        Self {
            name: name.into(),
            col_type,
            allow_null: true,
            max_length: None,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.allow_null = false;
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }
}

/// A table and, recursively, its child tables.
///
/// Child rows are linked to their parent by containment; `parent_key` only
/// names the column the backing store uses for the relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub name: String,
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    pub cols: Vec<ColDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TableDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            parent_key: None,
            cols: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn col(mut self, col: ColDef) -> Self {
        self.cols.push(col);
        self
    }

    pub fn child(mut self, mut child: TableDef, parent_key: impl Into<String>) -> Self {
        child.parent_key = Some(parent_key.into());
        self.children.push(child);
        self
    }

    pub fn find_col(&self, name: &str) -> Option<&ColDef> {
        self.cols.iter().find(|c| c.name == name)
    }

    pub fn find_child(&self, name: &str) -> Option<&TableDef> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The primary key column definition
    pub fn pk_col(&self) -> Option<&ColDef> {
        self.find_col(&self.primary_key)
    }

    /// Visit this table and all descendants, depth first
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a TableDef)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }
}

/// Definition of one daton type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatonDef {
    pub name: String,
    /// Editable and lockable (persiston) vs read-only query result (viewon)
    pub is_persiston: bool,
    /// Main table holds a list of rows rather than a single row
    #[serde(default)]
    pub multiple_main_rows: bool,
    /// Which backing store holds this type's data
    #[serde(default)]
    pub database_number: u32,
    pub main_table: TableDef,
}

impl DatonDef {
    pub fn persiston(name: impl Into<String>, main_table: TableDef) -> Self {
        Self {
            name: name.into(),
            is_persiston: true,
            multiple_main_rows: false,
            database_number: 0,
            main_table,
        }
    }

    pub fn viewon(name: impl Into<String>, main_table: TableDef) -> Self {
        Self {
            name: name.into(),
            is_persiston: false,
            multiple_main_rows: true,
            database_number: 0,
            main_table,
        }
    }

    pub fn with_multiple_main_rows(mut self) -> Self {
        self.multiple_main_rows = true;
        self
    }

    pub fn in_database(mut self, database_number: u32) -> Self {
        self.database_number = database_number;
        self
    }
}

/// The whole schema catalog, keyed by daton type name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDictionary {
    pub datons: BTreeMap<String, DatonDef>,
}

impl DataDictionary {
    pub fn new(defs: impl IntoIterator<Item = DatonDef>) -> Self {
        Self {
            datons: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    pub fn find_def(&self, type_name: &str) -> Option<&DatonDef> {
        self.datons.get(type_name)
    }

    pub fn find_def_for(&self, key: &DatonKey) -> Option<&DatonDef> {
        self.find_def(key.type_name())
    }
}
