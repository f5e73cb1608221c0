use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A column value snapshot. The relational store is dynamically typed per
/// cell, so each value carries its own tag.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParameter {
    String(String),
    Double(f64),
    Integer(i64),
    Blob(Vec<u8>),
    Null,
}

impl SqlParameter {
    /// Integer view of a cell. NULL reads as 0 and REAL is truncated,
    /// the way SQLite coerces in numeric comparisons.
    pub fn as_i64(&self) -> i64 {
        match self {
            SqlParameter::Integer(v) => *v,
            SqlParameter::Double(v) => *v as i64,
            SqlParameter::String(s) => s.trim().parse().unwrap_or(0),
            SqlParameter::Blob(_) | SqlParameter::Null => 0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlParameter::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SqlParameter::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlParameter::Null)
    }
}

/// A typed value in the structured key/value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyValueValue {
    Blob(Vec<u8>),
    Bool(bool),
    Float(f32),
    Integer(i32),
    Long(i64),
    String(String),
}

impl KeyValueValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            KeyValueValue::Blob(_) => "blob",
            KeyValueValue::Bool(_) => "bool",
            KeyValueValue::Float(_) => "float",
            KeyValueValue::Integer(_) => "integer",
            KeyValueValue::Long(_) => "long",
            KeyValueValue::String(_) => "string",
        }
    }
}

/// A value in the legacy flat preference files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    String(String),
    StringSet(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupEventKind {
    Progress,
    Finished,
}

/// Progress report published while an export or import runs.
///
/// `estimated_total` is advisory only and is 0 on import, where the total is
/// unknown until the end frame is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub kind: BackupEventKind,
    pub count: u64,
    pub estimated_total: u64,
}

impl BackupEvent {
    pub fn progress(count: u64, estimated_total: u64) -> Self {
        Self {
            kind: BackupEventKind::Progress,
            count,
            estimated_total,
        }
    }

    pub fn finished(count: u64, estimated_total: u64) -> Self {
        Self {
            kind: BackupEventKind::Finished,
            count,
            estimated_total,
        }
    }
}
