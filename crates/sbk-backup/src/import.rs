//! Importer: replays a frame stream into the local stores inside one
//! transaction spanning the relational and key/value stores.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rusqlite::{Connection, TransactionBehavior};
use sbk_core::config::BackupConfig;
use sbk_core::{
    BackupError, BackupEvent, BackupResult, KeyValueValue, PreferenceValue, SqlParameter,
    TableRules,
};
use sbk_crypto::PassphraseKdf;
use sbk_store::sql::{self, quote_ident};
use sbk_store::{BlobStore, KeyValueStore, NewBlob, PreferenceStore, StagedAvatar};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::frame::BackupFrame;
use crate::reader::{FrameReader, DEFAULT_MAX_FRAME_LENGTH};

/// Historical preference file whose identity keys now live in the key/value store.
const LEGACY_PREFERENCES_FILE: &str = "SecureSMS-Preferences";
const LEGACY_IDENTITY_KEYS: [(&str, &str); 2] = [
    ("pref_identity_public_v3", "account.aci_identity_public_key"),
    ("pref_identity_private_v3", "account.aci_identity_private_key"),
];

/// What an import applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub frames: u64,
    pub statements: u64,
    pub skipped_statements: u64,
    pub preferences: u64,
    pub key_values: u64,
    pub attachments: u64,
    pub stickers: u64,
    pub avatars: u64,
    /// Payloads dropped after a failed MAC check
    pub bad_payloads: u64,
}

pub struct Importer<'a> {
    db: &'a mut Connection,
    key_values: &'a mut dyn KeyValueStore,
    preferences: &'a mut dyn PreferenceStore,
    blobs: &'a BlobStore,
    rules: TableRules,
    progress_interval: u64,
    max_frame_length: u32,
    events: EventBus,
}

impl<'a> Importer<'a> {
    pub fn new(
        db: &'a mut Connection,
        key_values: &'a mut dyn KeyValueStore,
        preferences: &'a mut dyn PreferenceStore,
        blobs: &'a BlobStore,
    ) -> Self {
        Self {
            db,
            key_values,
            preferences,
            blobs,
            rules: TableRules::default(),
            progress_interval: 100,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            events: EventBus::default(),
        }
    }

    pub fn with_rules(mut self, rules: TableRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_backup_config(mut self, backup: &BackupConfig) -> Self {
        self.progress_interval = backup.progress_interval;
        self.max_frame_length = backup.max_frame_length;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn import_from<R: Read>(
        self,
        input: R,
        passphrase: &SecretString,
        kdf: &dyn PassphraseKdf,
    ) -> BackupResult<ImportSummary> {
        let reader =
            FrameReader::open(input, passphrase, kdf)?.with_max_frame_length(self.max_frame_length);
        self.import_stream(reader)
    }

    /// Import from an already opened reader. Either everything commits or
    /// the relational store, key/value store, preferences and existing
    /// avatars are left as they were and any blob written so far is removed.
    pub fn import_stream<R: Read>(self, mut reader: FrameReader<R>) -> BackupResult<ImportSummary> {
        let Importer {
            db,
            key_values,
            preferences,
            blobs,
            rules,
            progress_interval,
            events,
            ..
        } = self;
        let started = Instant::now();

        let tx = db.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        key_values.begin()?;

        let mut run = ImportRun {
            conn: &tx,
            key_values: &mut *key_values,
            preferences: &mut *preferences,
            blobs,
            rules: &rules,
            dropped: false,
            created: Vec::new(),
            staged_avatars: Vec::new(),
            summary: ImportSummary::default(),
        };
        let outcome = run.process(&mut reader, &events, progress_interval);
        let ImportRun {
            created,
            staged_avatars,
            summary,
            ..
        } = run;

        if let Err(e) = outcome {
            drop(tx);
            abort(key_values, preferences, blobs, &created);
            return Err(e);
        }
        if let Err(e) = tx.commit() {
            abort(key_values, preferences, blobs, &created);
            return Err(e.into());
        }
        if let Err(e) = key_values.commit() {
            warn!(
                error = %e,
                "database restored but key/value changes were not committed"
            );
            let staged: Vec<PathBuf> = staged_avatars.into_iter().map(|(path, _)| path).collect();
            abort(key_values, preferences, blobs, &staged);
            return Err(e);
        }
        if let Err(e) = preferences.flush() {
            warn!(
                error = %e,
                "database and key/value store restored but preferences were not written"
            );
            for (path, _) in &staged_avatars {
                discard_staged(blobs, path);
            }
            return Err(e);
        }
        for (staged, recipient_id) in &staged_avatars {
            if let Err(e) = blobs.promote_avatar(staged, recipient_id) {
                warn!(%recipient_id, error = %e, "cannot move restored avatar into place");
                discard_staged(blobs, staged);
            }
        }

        info!(
            frames = summary.frames,
            statements = summary.statements,
            attachments = summary.attachments,
            bad_payloads = summary.bad_payloads,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "import complete"
        );
        events.publish(BackupEvent::finished(summary.frames, 0));
        Ok(summary)
    }
}

fn abort(
    key_values: &mut dyn KeyValueStore,
    preferences: &mut dyn PreferenceStore,
    blobs: &BlobStore,
    created: &[PathBuf],
) {
    if let Err(e) = key_values.rollback() {
        warn!(error = %e, "key/value rollback failed");
    }
    if let Err(e) = preferences.discard() {
        warn!(error = %e, "discarding preference changes failed");
    }
    for path in created {
        if let Err(e) = blobs.delete(path) {
            warn!(path = %path.display(), error = %e, "cannot remove restored blob");
        }
    }
}

fn discard_staged(blobs: &BlobStore, path: &Path) {
    if let Err(e) = blobs.delete(path) {
        warn!(path = %path.display(), error = %e, "cannot remove staged avatar");
    }
}

struct ImportRun<'r> {
    conn: &'r Connection,
    key_values: &'r mut dyn KeyValueStore,
    preferences: &'r mut dyn PreferenceStore,
    blobs: &'r BlobStore,
    rules: &'r TableRules,
    dropped: bool,
    created: Vec<PathBuf>,
    /// Restored avatars, moved over their slots once everything has committed
    staged_avatars: Vec<(PathBuf, String)>,
    summary: ImportSummary,
}

impl ImportRun<'_> {
    fn process<R: Read>(
        &mut self,
        reader: &mut FrameReader<R>,
        events: &EventBus,
        progress_interval: u64,
    ) -> BackupResult<()> {
        let interval = progress_interval.max(1);
        loop {
            let frame = reader.read_frame()?;
            if frame == BackupFrame::End {
                // an empty backup still replaces local state
                return self.drop_existing_tables();
            }

            if self.summary.frames % interval == 0 {
                events.publish(BackupEvent::progress(self.summary.frames, 0));
            }
            self.summary.frames += 1;

            // the version check runs before anything destructive
            if !matches!(frame, BackupFrame::DatabaseVersion(_)) {
                self.drop_existing_tables()?;
            }
            self.apply(frame, reader)?;
        }
    }

    fn apply<R: Read>(&mut self, frame: BackupFrame, reader: &mut FrameReader<R>) -> BackupResult<()> {
        match frame {
            BackupFrame::DatabaseVersion(version) => self.apply_version(version),
            BackupFrame::SqlStatement { text, parameters } => {
                self.apply_statement(&text, &parameters)
            }
            BackupFrame::SharedPreference { file, key, value } => {
                self.apply_preference(&file, &key, value)
            }
            BackupFrame::KeyValue { key, value } => match value {
                Some(value) => {
                    self.key_values.put(&key, &value)?;
                    self.summary.key_values += 1;
                    Ok(())
                }
                None => {
                    info!(key = %key, "key/value frame without a value, skipping");
                    Ok(())
                }
            },
            BackupFrame::Attachment {
                row_id,
                unique_id,
                length,
            } => self.apply_attachment(reader, row_id, unique_id, length),
            BackupFrame::Sticker { row_id, length } => self.apply_sticker(reader, row_id, length),
            BackupFrame::Avatar {
                name,
                recipient_id,
                length,
            } => self.apply_avatar(reader, name.as_deref(), recipient_id.as_deref(), length),
            // the reader rejects a second header and the loop handles End
            BackupFrame::Header { .. } | BackupFrame::End => Ok(()),
        }
    }

    fn drop_existing_tables(&mut self) -> BackupResult<()> {
        if self.dropped {
            return Ok(());
        }
        for table in &self.rules.drop_first {
            sql::drop_table(self.conn, table)?;
        }
        let mut dropped = 0usize;
        for table in sql::table_names(self.conn)? {
            if !TableRules::is_internal(&table) {
                sql::drop_table(self.conn, &table)?;
                dropped += 1;
            }
        }
        self.dropped = true;
        debug!(tables = dropped, "dropped existing tables");
        Ok(())
    }

    fn apply_version(&mut self, version: i32) -> BackupResult<()> {
        let local = sql::user_version(self.conn)?;
        if version > local {
            return Err(BackupError::Downgrade {
                local,
                backup: version,
            });
        }
        sql::set_user_version(self.conn, version)?;
        debug!(version, local, "applied database version");
        Ok(())
    }

    fn apply_statement(&mut self, text: &str, parameters: &[SqlParameter]) -> BackupResult<()> {
        if self.rules.is_ignored_statement(text) {
            info!(statement = text, "ignoring statement");
            self.summary.skipped_statements += 1;
            return Ok(());
        }
        sql::execute(self.conn, text, parameters)?;
        self.summary.statements += 1;
        Ok(())
    }

    fn apply_preference(
        &mut self,
        file: &str,
        key: &str,
        value: Option<PreferenceValue>,
    ) -> BackupResult<()> {
        if file == LEGACY_PREFERENCES_FILE {
            let target = LEGACY_IDENTITY_KEYS
                .iter()
                .find(|(legacy, _)| *legacy == key)
                .map(|(_, target)| *target);
            match (target, value) {
                (Some(target), Some(PreferenceValue::String(encoded))) => {
                    let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                        BackupError::Malformed(format!("legacy identity key {key}: {e}"))
                    })?;
                    self.key_values.put(target, &KeyValueValue::Blob(bytes))?;
                    self.summary.key_values += 1;
                    debug!(key, target, "restored legacy identity key");
                }
                _ => debug!(key, "ignoring legacy preference"),
            }
            return Ok(());
        }

        match value {
            Some(value) => {
                self.preferences.put(file, key, value);
                self.summary.preferences += 1;
            }
            None => debug!(file, key, "preference frame without a value, skipping"),
        }
        Ok(())
    }

    fn apply_attachment<R: Read>(
        &mut self,
        reader: &mut FrameReader<R>,
        row_id: i64,
        unique_id: i64,
        length: u32,
    ) -> BackupResult<()> {
        let t = &self.rules.attachment_table;
        let where_clause = format!(
            "WHERE {} = ? AND {} = ?",
            quote_ident(&t.row_id_column),
            quote_ident(&t.unique_id_column)
        );
        let table = quote_ident(&t.table);
        let data = quote_ident(&t.data_column);
        let random_column = quote_ident(&t.random_column);

        let NewBlob {
            path,
            random,
            mut writer,
        } = self.blobs.create_attachment()?;
        self.created.push(path.clone());

        match reader.read_payload_to(length, &mut writer) {
            Ok(()) => {
                writer.finish()?;
                sql::execute(
                    self.conn,
                    &format!("UPDATE {table} SET {data} = ?, {random_column} = ? {where_clause}"),
                    &[
                        SqlParameter::String(path.to_string_lossy().into_owned()),
                        SqlParameter::Blob(random.to_vec()),
                        SqlParameter::Integer(row_id),
                        SqlParameter::Integer(unique_id),
                    ],
                )?;
                self.summary.attachments += 1;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(row_id, unique_id, "bad MAC on attachment payload, dropping its data");
                drop(writer);
                self.blobs.delete(&path)?;
                sql::execute(
                    self.conn,
                    &format!(
                        "UPDATE {table} SET {data} = NULL, {random_column} = NULL {where_clause}"
                    ),
                    &[SqlParameter::Integer(row_id), SqlParameter::Integer(unique_id)],
                )?;
                self.summary.bad_payloads += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_sticker<R: Read>(
        &mut self,
        reader: &mut FrameReader<R>,
        row_id: i64,
        length: u32,
    ) -> BackupResult<()> {
        let t = &self.rules.sticker_table;
        let table = quote_ident(&t.table);
        let id = quote_ident(&t.id_column);
        let path_column = quote_ident(&t.path_column);
        let length_column = quote_ident(&t.length_column);
        let random_column = quote_ident(&t.random_column);

        let NewBlob {
            path,
            random,
            mut writer,
        } = self.blobs.create_sticker()?;
        self.created.push(path.clone());

        match reader.read_payload_to(length, &mut writer) {
            Ok(()) => {
                writer.finish()?;
                sql::execute(
                    self.conn,
                    &format!(
                        "UPDATE {table} SET {path_column} = ?, {length_column} = ?, {random_column} = ? WHERE {id} = ?"
                    ),
                    &[
                        SqlParameter::String(path.to_string_lossy().into_owned()),
                        SqlParameter::Integer(i64::from(length)),
                        SqlParameter::Blob(random.to_vec()),
                        SqlParameter::Integer(row_id),
                    ],
                )?;
                self.summary.stickers += 1;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(row_id, "bad MAC on sticker payload, dropping its data");
                drop(writer);
                self.blobs.delete(&path)?;
                sql::execute(
                    self.conn,
                    &format!(
                        "UPDATE {table} SET {path_column} = NULL, {random_column} = NULL WHERE {id} = ?"
                    ),
                    &[SqlParameter::Integer(row_id)],
                )?;
                self.summary.bad_payloads += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_avatar<R: Read>(
        &mut self,
        reader: &mut FrameReader<R>,
        name: Option<&str>,
        recipient_id: Option<&str>,
        length: u32,
    ) -> BackupResult<()> {
        let Some(recipient_id) = recipient_id else {
            self.clear_legacy_avatar(name)?;
            return self.discard_payload(reader, length);
        };

        let staged = match self.blobs.stage_avatar(recipient_id) {
            Ok(staged) => staged,
            Err(BackupError::Malformed(reason)) => {
                warn!(recipient_id, reason = %reason, "discarding avatar");
                return self.discard_payload(reader, length);
            }
            Err(e) => return Err(e),
        };
        let StagedAvatar {
            recipient_id,
            path,
            mut writer,
        } = staged;
        self.created.push(path.clone());

        match reader.read_payload_to(length, &mut writer) {
            Ok(()) => {
                writer.finish()?;
                self.staged_avatars.push((path, recipient_id));
                self.summary.avatars += 1;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!(%recipient_id, "bad MAC on avatar payload, dropping it");
                drop(writer);
                self.blobs.delete(&path)?;
                self.summary.bad_payloads += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Null the first existing legacy avatar column matching `name`.
    fn clear_legacy_avatar(&mut self, name: Option<&str>) -> BackupResult<()> {
        let Some(name) = name else {
            warn!("avatar frame without recipient or name");
            return Ok(());
        };
        for column in &self.rules.legacy_avatar_columns {
            if !sql::table_exists(self.conn, &column.table)? {
                continue;
            }
            let cleared = sql::execute(
                self.conn,
                &format!(
                    "UPDATE {} SET {} = NULL WHERE {} = ?",
                    quote_ident(&column.table),
                    quote_ident(&column.avatar_column),
                    quote_ident(&column.match_column)
                ),
                &[SqlParameter::String(name.to_string())],
            )?;
            debug!(table = %column.table, rows = cleared, "cleared legacy avatar reference");
            return Ok(());
        }
        warn!("no legacy avatar table present, skipping avatar restore");
        Ok(())
    }

    fn discard_payload<R: Read>(&mut self, reader: &mut FrameReader<R>, length: u32) -> BackupResult<()> {
        match reader.skip_payload(length) {
            Err(e) if e.is_recoverable() => {
                warn!("bad MAC on discarded avatar payload");
                self.summary.bad_payloads += 1;
                Ok(())
            }
            other => other,
        }
    }
}
