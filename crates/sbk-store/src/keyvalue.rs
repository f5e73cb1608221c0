//! Structured key/value settings store.
//!
//! Values keep their declared type in a side column so that a `Float` stays a
//! float and an `Integer` is never widened to a `Long` on the way back out.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use sbk_core::{BackupError, BackupResult, KeyValueValue};

/// Typed get/put contract the exporter and importer consume.
///
/// `begin`/`commit`/`rollback` let the importer bracket its writes together
/// with the relational transaction.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> BackupResult<Option<KeyValueValue>>;

    fn contains(&self, key: &str) -> BackupResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&mut self, key: &str, value: &KeyValueValue) -> BackupResult<()>;

    fn remove(&mut self, key: &str) -> BackupResult<()>;

    fn keys(&self) -> BackupResult<Vec<String>>;

    fn begin(&mut self) -> BackupResult<()>;

    fn commit(&mut self) -> BackupResult<()>;

    fn rollback(&mut self) -> BackupResult<()>;
}

const TYPE_BLOB: i64 = 0;
const TYPE_BOOLEAN: i64 = 1;
const TYPE_FLOAT: i64 = 2;
const TYPE_INTEGER: i64 = 3;
const TYPE_LONG: i64 = 4;
const TYPE_STRING: i64 = 5;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS key_value (
    key TEXT PRIMARY KEY,
    value,
    type INTEGER NOT NULL
)";

pub struct SqliteKeyValueStore {
    conn: Connection,
}

impl SqliteKeyValueStore {
    pub fn open(path: &Path) -> BackupResult<Self> {
        Self::from_connection(crate::sql::open_database(path)?)
    }

    pub fn open_in_memory() -> BackupResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> BackupResult<Self> {
        conn.execute_batch(CREATE_TABLE)?;
        Ok(Self { conn })
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> BackupResult<Option<KeyValueValue>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value, type FROM key_value WHERE key = ?")?;
        let mut rows = stmt.query(params![key])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let kind: i64 = row.get(1)?;
        let value = row.get_ref(0)?;
        decode(key, kind, value).map(Some)
    }

    fn put(&mut self, key: &str, value: &KeyValueValue) -> BackupResult<()> {
        let sql = "INSERT OR REPLACE INTO key_value (key, value, type) VALUES (?, ?, ?)";
        match value {
            KeyValueValue::Blob(b) => self.conn.execute(sql, params![key, b, TYPE_BLOB]),
            KeyValueValue::Bool(b) => {
                self.conn
                    .execute(sql, params![key, *b as i64, TYPE_BOOLEAN])
            }
            KeyValueValue::Float(f) => {
                self.conn
                    .execute(sql, params![key, f64::from(*f), TYPE_FLOAT])
            }
            KeyValueValue::Integer(i) => self.conn.execute(sql, params![key, i, TYPE_INTEGER]),
            KeyValueValue::Long(l) => self.conn.execute(sql, params![key, l, TYPE_LONG]),
            KeyValueValue::String(s) => self.conn.execute(sql, params![key, s, TYPE_STRING]),
        }?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> BackupResult<()> {
        self.conn
            .execute("DELETE FROM key_value WHERE key = ?", params![key])?;
        Ok(())
    }

    fn keys(&self) -> BackupResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM key_value ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn begin(&mut self) -> BackupResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> BackupResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> BackupResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

fn decode(key: &str, kind: i64, value: ValueRef<'_>) -> BackupResult<KeyValueValue> {
    let mismatch = || BackupError::UnknownType(format!("{key}: stored type {kind} does not match its value"));
    Ok(match (kind, value) {
        (TYPE_BLOB, ValueRef::Blob(b)) => KeyValueValue::Blob(b.to_vec()),
        (TYPE_BOOLEAN, ValueRef::Integer(i)) => KeyValueValue::Bool(i != 0),
        (TYPE_FLOAT, ValueRef::Real(f)) => KeyValueValue::Float(f as f32),
        (TYPE_INTEGER, ValueRef::Integer(i)) => {
            KeyValueValue::Integer(i32::try_from(i).map_err(|_| mismatch())?)
        }
        (TYPE_LONG, ValueRef::Integer(i)) => KeyValueValue::Long(i),
        (TYPE_STRING, ValueRef::Text(t)) => {
            KeyValueValue::String(String::from_utf8(t.to_vec()).map_err(|_| mismatch())?)
        }
        (TYPE_BLOB..=TYPE_STRING, _) => return Err(mismatch()),
        (other, _) => {
            return Err(BackupError::UnknownType(format!(
                "{key}: unknown key/value type tag {other}"
            )))
        }
    })
}
