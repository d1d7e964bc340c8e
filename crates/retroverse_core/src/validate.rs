//! Field validation before persistence.

use serde_json::Value;

use crate::daton::{Daton, Row};
use crate::schema::{DatonDef, TableDef};

/// Validation hook run on every modified persiston before it is saved.
pub trait Validator: Send + Sync {
    /// Human readable problems with `daton`; empty when it may be saved
    fn validate(&self, def: &DatonDef, daton: &Daton) -> Vec<String>;
}

/// Checks nullability, maximum length and value type of every column
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, def: &DatonDef, daton: &Daton) -> Vec<String> {
        let mut errors = Vec::new();
        check_rows(&def.main_table, &daton.rows, &mut errors);
        errors
    }
}

fn check_rows(table: &TableDef, rows: &[Row], errors: &mut Vec<String>) {
    for row in rows {
        for col in &table.cols {
            match row.get(&col.name) {
                None | Some(Value::Null) => {
                    if !col.allow_null && col.name != table.primary_key {
                        errors.push(format!("{}.{} is required", table.name, col.name));
                    }
                }
                Some(value) => {
                    if !col.col_type.accepts(value) {
                        errors.push(format!("{}.{} has the wrong type", table.name, col.name));
                    } else if let (Some(max), Some(s)) = (col.max_length, value.as_str()) {
                        if s.chars().count() > max {
                            errors.push(format!(
                                "{}.{} is longer than {} characters",
                                table.name, col.name, max
                            ));
                        }
                    }
                }
            }
        }
        for child in &table.children {
            check_rows(child, row.child_rows(&child.name), errors);
        }
    }
}
