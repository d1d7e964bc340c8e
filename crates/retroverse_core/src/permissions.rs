//! Users and the permission resolver contract.
//!
//! Policy lives with the embedding application; the engine only asks for the
//! final level on a table or column and derives filtering and write checks
//! from it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::daton::{Daton, Row};
use crate::diff::{DiffTable, PersistonDiff};
use crate::schema::{DataDictionary, DatonDef, TableDef};

/// Identity of the caller behind a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Set of permission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionLevel(u8);

impl PermissionLevel {
    pub const NONE: Self = Self(0);
    pub const VIEW: Self = Self(1);
    pub const CREATE: Self = Self(2);
    pub const MODIFY: Self = Self(4);
    pub const DELETE: Self = Self(8);
    pub const ALL: Self = Self(15);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PermissionLevel {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-table levels sent to a client on initialize and after permission
/// changes.
pub type PermissionSnapshot = BTreeMap<String, PermissionLevel>;

pub trait PermissionResolver: Send + Sync {
    /// Effective level for `user` on a table, or on one column of it when
    /// `col` is given. `pristine` is the record as stored, when one exists.
    fn final_level(
        &self,
        user: &User,
        pristine: Option<&Daton>,
        table: &str,
        col: Option<&str>,
    ) -> PermissionLevel;

    /// Remove rows and columns `user` may not view
    fn hide_private_parts(&self, user: &User, def: &DatonDef, daton: &mut Daton) {
        let pristine = daton.clone();
        hide_rows(self, user, &pristine, &def.main_table, &mut daton.rows);
    }

    /// Human readable reasons `user` may not apply `diff`; empty when allowed
    fn disallowed_writes(
        &self,
        user: &User,
        pristine: Option<&Daton>,
        def: &DatonDef,
        diff: &PersistonDiff,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        check_table(self, user, pristine, &def.main_table, &diff.main, &mut errors);
        errors
    }

    /// Table-level snapshot across the whole dictionary
    fn snapshot(&self, user: &User, schema: &DataDictionary) -> PermissionSnapshot {
        let mut snapshot = PermissionSnapshot::new();
        for def in schema.datons.values() {
            def.main_table.walk(&mut |table| {
                snapshot.insert(table.name.clone(), self.final_level(user, None, &table.name, None));
            });
        }
        snapshot
    }
}

fn hide_rows<P: PermissionResolver + ?Sized>(
    resolver: &P,
    user: &User,
    pristine: &Daton,
    table: &TableDef,
    rows: &mut Vec<Row>,
) {
    if !resolver
        .final_level(user, Some(pristine), &table.name, None)
        .contains(PermissionLevel::VIEW)
    {
        rows.clear();
        return;
    }
    let hidden: Vec<&str> = table
        .cols
        .iter()
        .filter(|c| {
            !resolver
                .final_level(user, Some(pristine), &table.name, Some(&c.name))
                .contains(PermissionLevel::VIEW)
        })
        .map(|c| c.name.as_str())
        .collect();
    for row in rows.iter_mut() {
        for col in &hidden {
            row.values.remove(*col);
        }
        for child in &table.children {
            if let Some(child_rows) = row.children.get_mut(&child.name) {
                hide_rows(resolver, user, pristine, child, child_rows);
            }
        }
    }
}

fn check_table<P: PermissionResolver + ?Sized>(
    resolver: &P,
    user: &User,
    pristine: Option<&Daton>,
    table: &TableDef,
    diff: &DiffTable,
    errors: &mut Vec<String>,
) {
    let level = resolver.final_level(user, pristine, &table.name, None);
    if !diff.new.is_empty() && !level.contains(PermissionLevel::CREATE) {
        errors.push(format!("Not permitted to add rows to {}", table.name));
    }
    if !diff.deleted.is_empty() && !level.contains(PermissionLevel::DELETE) {
        errors.push(format!("Not permitted to delete rows from {}", table.name));
    }
    for row in &diff.modified {
        for col in row.values.keys().filter(|c| **c != table.primary_key) {
            if !resolver
                .final_level(user, pristine, &table.name, Some(col))
                .contains(PermissionLevel::MODIFY)
            {
                errors.push(format!("Not permitted to change {}.{}", table.name, col));
            }
        }
    }
    for row in diff.new.iter().chain(&diff.modified) {
        for child in &table.children {
            if let Some(child_diff) = row.children.get(&child.name) {
                check_table(resolver, user, pristine, child, child_diff, errors);
            }
        }
    }
}

/// Grants everything to everyone
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionResolver for AllowAll {
    fn final_level(&self, _: &User, _: Option<&Daton>, _: &str, _: Option<&str>) -> PermissionLevel {
        PermissionLevel::ALL
    }
}
