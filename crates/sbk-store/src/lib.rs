//! sbk-store: the local stores a backup is exported from and imported into
//!
//! - [`sql`]: helpers over a `rusqlite::Connection` (schema, typed rows, versions)
//! - [`keyvalue`]: typed key/value settings in their own SQLite database
//! - [`prefs`]: legacy flat preference files, persisted as one JSON document
//! - [`blobs`]: encrypted attachment, sticker and avatar files

pub mod blobs;
pub mod keyvalue;
pub mod prefs;
pub mod sql;

pub use blobs::{AvatarEntry, BlobStore, NewBlob, StagedAvatar};
pub use keyvalue::{KeyValueStore, SqliteKeyValueStore};
pub use prefs::{JsonPreferenceStore, PreferenceStore};
pub use sql::{open_database, SchemaEntry};
