//! Relational store helpers.
//!
//! Everything here takes `&Connection`, so it works equally on a plain
//! connection and inside a `rusqlite::Transaction` (which derefs to one).

use std::path::Path;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use sbk_core::{BackupError, BackupResult, SqlParameter};

/// Open (or create) a SQLite database file, creating parent directories.
pub fn open_database(path: &Path) -> BackupResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

/// Schema version (`PRAGMA user_version`)
pub fn user_version(conn: &Connection) -> BackupResult<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub fn set_user_version(conn: &Connection, version: i32) -> BackupResult<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// One row of `sqlite_master` that carries creation SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    pub sql: String,
    pub name: String,
    /// `table`, `index`, `trigger` or `view`
    pub kind: String,
}

impl SchemaEntry {
    pub fn is_table(&self) -> bool {
        self.kind == "table"
    }
}

/// Schema definitions in storage order. Auto-indexes have no SQL and are left out.
pub fn schema_entries(conn: &Connection) -> BackupResult<Vec<SchemaEntry>> {
    let mut stmt =
        conn.prepare("SELECT sql, name, type FROM sqlite_master WHERE sql IS NOT NULL")?;
    let entries = stmt
        .query_map([], |row| {
            Ok(SchemaEntry {
                sql: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Names of every table currently in the schema, internal ones included.
pub fn table_names(conn: &Connection) -> BackupResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

pub fn table_exists(conn: &Connection, name: &str) -> BackupResult<bool> {
    let found: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![name],
        |row| row.get(0),
    )?;
    Ok(found > 0)
}

pub fn drop_table(conn: &Connection, name: &str) -> BackupResult<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    Ok(())
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `INSERT INTO "table" VALUES (?,?,...)` for a row of `columns` cells.
pub fn insert_statement(table: &str, columns: usize) -> String {
    let placeholders = vec!["?"; columns].join(",");
    format!("INSERT INTO {} VALUES ({placeholders})", quote_ident(table))
}

/// Execute one statement, binding `params` positionally with their own types.
pub fn execute(conn: &Connection, sql: &str, params: &[SqlParameter]) -> BackupResult<usize> {
    let values = params.iter().map(to_value);
    Ok(conn.execute(sql, params_from_iter(values))?)
}

/// Column names of a result set, in order.
#[derive(Debug, Clone)]
pub struct Columns {
    names: Vec<String>,
}

impl Columns {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> BackupResult<usize> {
        self.names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| BackupError::Malformed(format!("no column named {name}")))
    }
}

/// Stream the rows of a query, one typed cell vector at a time.
pub fn for_each_row<F>(
    conn: &Connection,
    sql: &str,
    params: &[SqlParameter],
    mut f: F,
) -> BackupResult<()>
where
    F: FnMut(&Columns, &[SqlParameter]) -> BackupResult<()>,
{
    let mut stmt = conn.prepare(sql)?;
    let columns = Columns {
        names: stmt.column_names().iter().map(|s| s.to_string()).collect(),
    };
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_value)))?;
    let mut cells = Vec::with_capacity(columns.len());
    while let Some(row) = rows.next()? {
        cells.clear();
        for i in 0..columns.len() {
            cells.push(to_parameter(row.get_ref(i)?, sql, &columns.names[i]));
        }
        f(&columns, &cells)?;
    }
    Ok(())
}

/// First column of the first row as an integer, 0 when there is no row.
pub fn count(conn: &Connection, sql: &str, params: &[SqlParameter]) -> BackupResult<i64> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_value)))?;
    match rows.next()? {
        Some(row) => Ok(row.get::<_, Option<i64>>(0)?.unwrap_or(0)),
        None => Ok(0),
    }
}

/// SQLite lets a TEXT cell hold arbitrary bytes; those are decoded lossily.
fn to_parameter(value: ValueRef<'_>, query: &str, column: &str) -> SqlParameter {
    match value {
        ValueRef::Null => SqlParameter::Null,
        ValueRef::Integer(i) => SqlParameter::Integer(i),
        ValueRef::Real(f) => SqlParameter::Double(f),
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(text) => SqlParameter::String(text.to_string()),
            Err(_) => {
                tracing::warn!(query, column, "text cell is not valid UTF-8, decoding lossily");
                SqlParameter::String(String::from_utf8_lossy(t).into_owned())
            }
        },
        ValueRef::Blob(b) => SqlParameter::Blob(b.to_vec()),
    }
}

fn to_value(param: &SqlParameter) -> Value {
    match param {
        SqlParameter::String(s) => Value::Text(s.clone()),
        SqlParameter::Double(f) => Value::Real(*f),
        SqlParameter::Integer(i) => Value::Integer(*i),
        SqlParameter::Blob(b) => Value::Blob(b.clone()),
        SqlParameter::Null => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE messages (id INTEGER PRIMARY KEY, body TEXT, score REAL, raw BLOB);
             CREATE INDEX messages_body ON messages (body);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_user_version_roundtrip() {
        let conn = memory_db();
        assert_eq!(user_version(&conn).unwrap(), 0);
        set_user_version(&conn, 42).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 42);
    }

    #[test]
    fn test_schema_entries_in_order() {
        let conn = memory_db();
        let entries = schema_entries(&conn).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "messages");
        assert!(entries[0].is_table());
        assert_eq!(entries[1].kind, "index");
    }

    #[test]
    fn test_typed_rows_roundtrip() {
        let conn = memory_db();
        let row = vec![
            SqlParameter::Integer(1),
            SqlParameter::String("hi".into()),
            SqlParameter::Double(0.5),
            SqlParameter::Blob(vec![0, 1, 2]),
        ];
        execute(&conn, &insert_statement("messages", 4), &row).unwrap();
        execute(
            &conn,
            &insert_statement("messages", 4),
            &[
                SqlParameter::Integer(2),
                SqlParameter::Null,
                SqlParameter::Null,
                SqlParameter::Null,
            ],
        )
        .unwrap();

        let mut seen = Vec::new();
        for_each_row(&conn, "SELECT * FROM messages ORDER BY id", &[], |cols, cells| {
            assert_eq!(cols.index_of("body").unwrap(), 1);
            seen.push(cells.to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], row);
        assert!(seen[1][1].is_null());
    }

    #[test]
    fn test_invalid_utf8_text_is_decoded_lossily() {
        let conn = memory_db();
        conn.execute_batch("INSERT INTO messages (id, body) VALUES (1, CAST(x'fffe41' AS TEXT));")
            .unwrap();

        let mut bodies = Vec::new();
        for_each_row(&conn, "SELECT body FROM messages", &[], |_, cells| {
            bodies.push(cells[0].clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            bodies,
            vec![SqlParameter::String("\u{fffd}\u{fffd}A".into())]
        );
    }

    #[test]
    fn test_count_and_exists() {
        let conn = memory_db();
        assert!(table_exists(&conn, "messages").unwrap());
        assert!(!table_exists(&conn, "missing").unwrap());
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM messages", &[]).unwrap(), 0);
        assert_eq!(
            count(&conn, "SELECT MAX(id) FROM messages", &[]).unwrap(),
            0,
            "NULL aggregate reads as zero"
        );
    }

    #[test]
    fn test_drop_table_quoted() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE \"odd \"\"name\" (x)").unwrap();
        drop_table(&conn, "odd \"name").unwrap();
        assert!(table_names(&conn).unwrap().is_empty());
        // dropping again is a no-op
        drop_table(&conn, "odd \"name").unwrap();
    }

    #[test]
    fn test_missing_column_is_malformed() {
        let conn = memory_db();
        execute(
            &conn,
            "INSERT INTO messages (id) VALUES (?)",
            &[SqlParameter::Integer(1)],
        )
        .unwrap();
        let err = for_each_row(&conn, "SELECT * FROM messages", &[], |cols, _| {
            cols.index_of("expires_in").map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, BackupError::Malformed(_)));
    }

    #[test]
    fn test_open_database_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("app.db");
        let conn = open_database(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x)").unwrap();
        assert!(path.exists());
    }
}
