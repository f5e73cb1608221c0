//! Shared fixtures: a throwaway "device" with all four local stores.

#![allow(dead_code)]

use std::io::{Cursor, Read, Write};

use rusqlite::Connection;
use sbk_backup::{Exporter, ImportSummary, Importer};
use sbk_core::{BackupResult, SqlParameter};
use sbk_crypto::{AttachmentSecret, IteratedSha512};
use sbk_store::sql;
use sbk_store::{BlobStore, JsonPreferenceStore, SqliteKeyValueStore};
use secrecy::SecretString;
use tempfile::TempDir;

pub const MESSENGER_SCHEMA: &str = "
CREATE TABLE sms (_id INTEGER PRIMARY KEY, body TEXT, expires_in INTEGER DEFAULT 0);
CREATE TABLE mms (_id INTEGER PRIMARY KEY, body TEXT, expires_in INTEGER DEFAULT 0, view_once INTEGER DEFAULT 0);
CREATE TABLE reaction (_id INTEGER PRIMARY KEY, message_id INTEGER, is_mms INTEGER, emoji TEXT);
CREATE TABLE mention (_id INTEGER PRIMARY KEY, message_id INTEGER, recipient_id INTEGER);
CREATE TABLE group_receipts (_id INTEGER PRIMARY KEY, mms_id INTEGER, address INTEGER, status INTEGER);
CREATE TABLE part (_id INTEGER PRIMARY KEY, mid INTEGER, unique_id INTEGER, data_size INTEGER, _data TEXT, data_random BLOB, content_type TEXT);
CREATE TABLE sticker (_id INTEGER PRIMARY KEY, pack_id TEXT, file_path TEXT, file_length INTEGER, file_random BLOB);
CREATE TABLE recipient (_id INTEGER PRIMARY KEY, phone TEXT, signal_profile_avatar TEXT);
CREATE TABLE sessions (_id INTEGER PRIMARY KEY, address TEXT, record BLOB);
CREATE INDEX mms_expires_index ON mms (expires_in);
";

pub fn passphrase() -> SecretString {
    SecretString::from("correct horse battery staple".to_string())
}

/// Few rounds keep the tests fast; the derivation itself is covered in sbk-crypto.
pub fn kdf() -> IteratedSha512 {
    IteratedSha512 { iterations: 16 }
}

pub struct Device {
    pub dir: TempDir,
    pub db: Connection,
    pub kv: SqliteKeyValueStore,
    pub prefs: JsonPreferenceStore,
    pub blobs: BlobStore,
}

impl Device {
    pub fn new(version: i32) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let db = sql::open_database(&dir.path().join("app.db")).expect("open db");
        sql::set_user_version(&db, version).expect("set version");
        let kv = SqliteKeyValueStore::open(&dir.path().join("kv.db")).expect("open kv");
        let prefs = JsonPreferenceStore::open(&dir.path().join("prefs.json")).expect("open prefs");
        let blobs = BlobStore::open(&dir.path().join("blobs"), AttachmentSecret::generate())
            .expect("open blobs");
        Self {
            dir,
            db,
            kv,
            prefs,
            blobs,
        }
    }

    pub fn messenger(version: i32) -> Self {
        let device = Self::new(version);
        device
            .db
            .execute_batch(MESSENGER_SCHEMA)
            .expect("create schema");
        device
    }

    pub fn exec(&self, statement: &str) {
        self.db.execute_batch(statement).expect(statement);
    }

    pub fn exporter(&self) -> Exporter<'_> {
        Exporter::new(&self.db, &self.kv, &self.prefs, &self.blobs)
    }

    pub fn importer(&mut self) -> Importer<'_> {
        Importer::new(&mut self.db, &mut self.kv, &mut self.prefs, &self.blobs)
    }

    pub fn export_bytes(&self) -> Vec<u8> {
        self.exporter()
            .transfer(Vec::new(), &passphrase(), &kdf())
            .expect("export")
    }

    pub fn import_bytes(&mut self, bytes: &[u8]) -> BackupResult<ImportSummary> {
        self.importer()
            .import_from(Cursor::new(bytes), &passphrase(), &kdf())
    }

    /// Store `body` as a modern part and insert its `part` row.
    pub fn add_attachment(&self, id: i64, mid: i64, unique_id: i64, body: &[u8]) {
        let mut blob = self.blobs.create_attachment().expect("create part");
        blob.writer.write_all(body).expect("write part");
        blob.writer.finish().expect("finish part");
        sql::execute(
            &self.db,
            "INSERT INTO part (_id, mid, unique_id, data_size, _data, data_random, content_type) VALUES (?, ?, ?, ?, ?, ?, ?)",
            &[
                SqlParameter::Integer(id),
                SqlParameter::Integer(mid),
                SqlParameter::Integer(unique_id),
                SqlParameter::Integer(body.len() as i64),
                SqlParameter::String(blob.path.to_string_lossy().into_owned()),
                SqlParameter::Blob(blob.random.to_vec()),
                SqlParameter::String("image/jpeg".into()),
            ],
        )
        .expect("insert part");
    }

    pub fn add_sticker(&self, id: i64, body: &[u8]) {
        let mut blob = self.blobs.create_sticker().expect("create sticker");
        blob.writer.write_all(body).expect("write sticker");
        blob.writer.finish().expect("finish sticker");
        sql::execute(
            &self.db,
            "INSERT INTO sticker (_id, pack_id, file_path, file_length, file_random) VALUES (?, ?, ?, ?, ?)",
            &[
                SqlParameter::Integer(id),
                SqlParameter::String("pack".into()),
                SqlParameter::String(blob.path.to_string_lossy().into_owned()),
                SqlParameter::Integer(body.len() as i64),
                SqlParameter::Blob(blob.random.to_vec()),
            ],
        )
        .expect("insert sticker");
    }

    pub fn add_avatar(&self, recipient_id: &str, body: &[u8]) {
        let mut w = self.blobs.avatar_writer(recipient_id).expect("avatar writer");
        w.write_all(body).expect("write avatar");
        w.finish().expect("finish avatar");
    }

    pub fn rows(&self, query: &str) -> Vec<Vec<SqlParameter>> {
        let mut rows = Vec::new();
        sql::for_each_row(&self.db, query, &[], |_, cells| {
            rows.push(cells.to_vec());
            Ok(())
        })
        .expect(query);
        rows
    }

    pub fn ids(&self, table: &str) -> Vec<i64> {
        self.rows(&format!("SELECT _id FROM {table} ORDER BY _id"))
            .into_iter()
            .map(|r| r[0].as_i64())
            .collect()
    }

    /// Plaintext of the part referenced by a `part` row.
    pub fn attachment_bytes(&self, id: i64) -> Option<Vec<u8>> {
        let rows = self.rows(&format!(
            "SELECT _data, data_random FROM part WHERE _id = {id}"
        ));
        let row = rows.first()?;
        let path = row[0].as_str()?;
        let mut out = Vec::new();
        self.blobs
            .open_part(std::path::Path::new(path), row[1].as_blob())
            .expect("open part")
            .read_to_end(&mut out)
            .expect("read part");
        Some(out)
    }
}

/// Offsets of every length-prefixed frame body after the cleartext header,
/// stopping at the first streamed payload (whose length is encrypted).
pub fn frame_offsets(bytes: &[u8], limit: usize) -> Vec<(usize, usize)> {
    let header_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let mut at = 4 + header_len;
    let mut frames = Vec::new();
    while frames.len() < limit && at + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        frames.push((at + 4, len));
        at += 4 + len;
    }
    frames
}
