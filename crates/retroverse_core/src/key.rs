//! Daton keys and their canonical string form.
//!
//! A key is either a *record key* (`Customer|=5`, `Customer|+` for the whole
//! table, `Customer|=-1` for an unsaved record) or a *query key*
//! (`CustomerList|City=Oslo|_sort=Name|_page=2`). Segments are separated by
//! `|`; a `|` or `\` inside a segment is escaped with `\`. Query criteria are
//! kept sorted by name so equal keys always produce identical strings, which
//! is what the key is compared and hashed by.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, RetroError};

const DELIMITER: char = '|';
const ESCAPE: char = '\\';
const SORT_SEGMENT: &str = "_sort";
const PAGE_SEGMENT: &str = "_page";

/// Primary key value that marks a record which has not been saved yet.
pub const NEW_RECORD_PK: &str = "-1";

/// Which rows of a persiston a record key addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPk {
    /// A single existing (or new, see [`NEW_RECORD_PK`]) main row
    Row(String),
    /// Every row of the main table
    WholeTable,
}

/// The two variants of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Record {
        type_name: String,
        pk: RecordPk,
    },
    Query {
        type_name: String,
        criteria: BTreeMap<String, String>,
        sort: Option<String>,
        page: Option<u32>,
    },
}

/// Immutable identifier of a daton.
#[derive(Clone)]
pub struct DatonKey {
    text: String,
    kind: KeyKind,
}

impl DatonKey {
    /// Key of an existing record
    pub fn record(type_name: impl Into<String>, pk: impl Into<String>) -> Self {
        Self::from_kind(KeyKind::Record {
            type_name: type_name.into(),
            pk: RecordPk::Row(pk.into()),
        })
    }

    /// Key of a record that has not been saved yet
    pub fn new_record(type_name: impl Into<String>) -> Self {
        Self::record(type_name, NEW_RECORD_PK)
    }

    /// Key addressing every row of a persiston's main table
    pub fn whole_table(type_name: impl Into<String>) -> Self {
        Self::from_kind(KeyKind::Record {
            type_name: type_name.into(),
            pk: RecordPk::WholeTable,
        })
    }

    /// Key of a query result. Criterion names must be non-empty, must not
    /// contain `=` and must not start with `_`, `=` or `+`.
    pub fn query<I, N, V>(
        type_name: impl Into<String>,
        criteria: I,
        sort: Option<String>,
        page: Option<u32>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let type_name = type_name.into();
        let mut map = BTreeMap::new();
        for (name, value) in criteria {
            let name = name.into();
            if !is_valid_criterion_name(&name) {
                return Err(RetroError::MalformedKey(format!(
                    "{}: bad criterion name '{}'",
                    type_name, name
                )));
            }
            map.insert(name, value.into());
        }
        if type_name.is_empty() {
            return Err(RetroError::MalformedKey(String::new()));
        }
        Ok(Self::from_kind(KeyKind::Query {
            type_name,
            criteria: map,
            sort,
            page,
        }))
    }

    fn from_kind(kind: KeyKind) -> Self {
        let text = format_kind(&kind);
        Self { text, kind }
    }

    /// Parse a canonical (or non-canonical but equivalent) key string
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || RetroError::MalformedKey(s.to_string());
        let segments = split_segments(s).ok_or_else(malformed)?;
        let (type_name, rest) = segments.split_first().ok_or_else(malformed)?;
        if type_name.is_empty() {
            return Err(malformed());
        }

        if let [only] = rest {
            if let Some(pk) = only.strip_prefix('=') {
                return Ok(Self::record(type_name.clone(), pk));
            }
            if only == "+" {
                return Ok(Self::whole_table(type_name.clone()));
            }
        }

        let mut criteria = BTreeMap::new();
        let mut sort = None;
        let mut page = None;
        for segment in rest {
            let (name, value) = segment.split_once('=').ok_or_else(malformed)?;
            match name {
                SORT_SEGMENT if sort.is_none() => sort = Some(value.to_string()),
                PAGE_SEGMENT if page.is_none() => {
                    page = Some(value.parse::<u32>().map_err(|_| malformed())?)
                }
                _ => {
                    if !is_valid_criterion_name(name)
                        || criteria
                            .insert(name.to_string(), value.to_string())
                            .is_some()
                    {
                        return Err(malformed());
                    }
                }
            }
        }

        Ok(Self::from_kind(KeyKind::Query {
            type_name: type_name.clone(),
            criteria,
            sort,
            page,
        }))
    }

    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            KeyKind::Record { type_name, .. } | KeyKind::Query { type_name, .. } => type_name,
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, KeyKind::Record { .. })
    }

    /// True for a record key whose pk is the new-record sentinel
    pub fn is_new(&self) -> bool {
        matches!(&self.kind, KeyKind::Record { pk: RecordPk::Row(pk), .. } if pk == NEW_RECORD_PK)
    }

    /// Primary key value of a single-row record key
    pub fn record_pk(&self) -> Option<&str> {
        match &self.kind {
            KeyKind::Record {
                pk: RecordPk::Row(pk),
                ..
            } => Some(pk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn is_valid_criterion_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('=')
        && !name.starts_with(['_', '=', '+'])
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == DELIMITER || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

fn format_kind(kind: &KeyKind) -> String {
    let mut out = String::new();
    match kind {
        KeyKind::Record { type_name, pk } => {
            escape_into(&mut out, type_name);
            out.push(DELIMITER);
            match pk {
                RecordPk::Row(pk) => {
                    out.push('=');
                    escape_into(&mut out, pk);
                }
                RecordPk::WholeTable => out.push('+'),
            }
        }
        KeyKind::Query {
            type_name,
            criteria,
            sort,
            page,
        } => {
            escape_into(&mut out, type_name);
            for (name, value) in criteria {
                out.push(DELIMITER);
                escape_into(&mut out, name);
                out.push('=');
                escape_into(&mut out, value);
            }
            if let Some(sort) = sort {
                out.push(DELIMITER);
                out.push_str(SORT_SEGMENT);
                out.push('=');
                escape_into(&mut out, sort);
            }
            if let Some(page) = page {
                out.push(DELIMITER);
                out.push_str(PAGE_SEGMENT);
                out.push('=');
                out.push_str(&page.to_string());
            }
        }
    }
    out
}

/// Split on unescaped delimiters, removing escapes. `None` on a dangling escape.
fn split_segments(s: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => current.push(chars.next()?),
            DELIMITER => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    Some(segments)
}

impl fmt::Display for DatonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for DatonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatonKey({})", self.text)
    }
}

impl PartialEq for DatonKey {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for DatonKey {}

impl Hash for DatonKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl FromStr for DatonKey {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self> {
        DatonKey::parse(s)
    }
}

impl Serialize for DatonKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for DatonKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DatonKey::parse(&s).map_err(serde::de::Error::custom)
    }
}
