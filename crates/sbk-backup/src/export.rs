//! Exporter: one sequential pass from the local stores into a frame stream.
//!
//! Frame order is fixed: database version, schema, table rows (with
//! attachment and sticker payloads right after their row), preferences,
//! key values, avatars, end.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::Connection;
use sbk_core::config::{BackupConfig, PreferenceKey};
use sbk_core::rules::{MessageOwner, MessageTable};
use sbk_core::{BackupError, BackupEvent, BackupResult, SqlParameter, TableRules};
use sbk_crypto::PassphraseKdf;
use sbk_store::sql::{self, quote_ident, Columns};
use sbk_store::{BlobStore, KeyValueStore, PreferenceStore};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::frame::BackupFrame;
use crate::writer::FrameWriter;

/// The identity key pair is always counted in the estimate.
const IDENTITY_FRAMES: u64 = 2;

/// Which rows of a table qualify for export.
enum RowFilter<'r> {
    All,
    Message(&'r MessageTable),
    Dependent {
        message_column: &'r str,
        owner: &'r MessageOwner,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Payload {
    None,
    Attachment,
    Sticker,
}

struct Progress<'e> {
    count: u64,
    estimate: u64,
    events: Option<&'e EventBus>,
}

impl Progress<'_> {
    fn step(&mut self) {
        self.count += 1;
        if let Some(events) = self.events {
            events.publish(BackupEvent::progress(self.count, self.estimate));
        }
    }
}

pub struct Exporter<'a> {
    db: &'a Connection,
    key_values: &'a dyn KeyValueStore,
    preferences: &'a dyn PreferenceStore,
    blobs: &'a BlobStore,
    rules: TableRules,
    preference_keys: Vec<PreferenceKey>,
    key_value_keys: Vec<String>,
    events: EventBus,
}

impl<'a> Exporter<'a> {
    pub fn new(
        db: &'a Connection,
        key_values: &'a dyn KeyValueStore,
        preferences: &'a dyn PreferenceStore,
        blobs: &'a BlobStore,
    ) -> Self {
        let backup = BackupConfig::default();
        Self {
            db,
            key_values,
            preferences,
            blobs,
            rules: TableRules::default(),
            preference_keys: backup.preferences,
            key_value_keys: backup.key_values,
            events: EventBus::default(),
        }
    }

    pub fn with_rules(mut self, rules: TableRules) -> Self {
        self.rules = rules;
        self
    }

    /// Take the preference and key/value allow-lists from config.
    pub fn with_backup_config(mut self, backup: &BackupConfig) -> Self {
        self.preference_keys = backup.preferences.clone();
        self.key_value_keys = backup.key_values.clone();
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Export into a new file, reporting progress after every unit of work.
    ///
    /// On error the partial file is left in place for the caller to remove.
    pub fn export_to_file(
        &self,
        path: &Path,
        passphrase: &SecretString,
        kdf: &dyn PassphraseKdf,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupEvent> {
        let started = Instant::now();
        let file = File::create(path)?;
        let mut writer = FrameWriter::new(BufWriter::new(file), passphrase, kdf)?;

        let finished = self.run(&mut writer, cancel, Some(&self.events))?;

        let file = writer
            .finish()?
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;

        info!(
            path = %path.display(),
            frames = finished.count,
            estimated = finished.estimated_total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "export complete"
        );
        self.events.publish(finished);
        Ok(finished)
    }

    /// Export into a caller-supplied stream. No incremental progress is
    /// reported; a single finished event is published at the end.
    pub fn transfer<W: Write>(
        &self,
        out: W,
        passphrase: &SecretString,
        kdf: &dyn PassphraseKdf,
    ) -> BackupResult<W> {
        let mut writer = FrameWriter::new(out, passphrase, kdf)?;
        let finished = self.run(&mut writer, &CancellationToken::new(), None)?;
        let out = writer.finish()?;
        self.events.publish(finished);
        Ok(out)
    }

    /// Export through an already opened frame writer.
    pub fn export_frames<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupEvent> {
        self.run(writer, cancel, Some(&self.events))
    }

    /// Advisory total for progress reporting.
    pub fn estimate(&self) -> BackupResult<u64> {
        let tables: Vec<String> = sql::schema_entries(self.db)?
            .into_iter()
            .filter(|e| e.is_table() && !self.rules.is_fts_shadow(&e.name))
            .map(|e| e.name)
            .collect();
        self.estimate_for(&tables)
    }

    fn run<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        cancel: &CancellationToken,
        events: Option<&EventBus>,
    ) -> BackupResult<BackupEvent> {
        let version = sql::user_version(self.db)?;
        writer.write_frame(&BackupFrame::DatabaseVersion(version))?;

        let phase = Instant::now();
        let tables = self.export_schema(writer)?;
        debug!(
            tables = tables.len(),
            elapsed_ms = phase.elapsed().as_millis() as u64,
            "exported schema"
        );

        let estimate = self.estimate_for(&tables)?;
        let mut progress = Progress {
            count: 1 + 3 * tables.len() as u64,
            estimate,
            events,
        };

        let phase = Instant::now();
        for table in &tables {
            check_cancelled(cancel)?;
            self.export_table(writer, table, &mut progress, cancel)?;
        }
        info!(
            tables = tables.len(),
            frames = progress.count,
            elapsed_ms = phase.elapsed().as_millis() as u64,
            "exported tables"
        );

        let phase = Instant::now();
        self.export_preferences(writer, &mut progress, cancel)?;
        debug!(elapsed_ms = phase.elapsed().as_millis() as u64, "exported preferences");

        let phase = Instant::now();
        self.export_key_values(writer, &mut progress, cancel)?;
        debug!(elapsed_ms = phase.elapsed().as_millis() as u64, "exported key values");

        let phase = Instant::now();
        self.export_avatars(writer, &mut progress, cancel)?;
        debug!(elapsed_ms = phase.elapsed().as_millis() as u64, "exported avatars");

        writer.write_frame(&BackupFrame::End)?;
        Ok(BackupEvent::finished(progress.count + 1, estimate))
    }

    /// Write every schema statement and collect the table names in storage order.
    fn export_schema<W: Write>(&self, writer: &mut FrameWriter<W>) -> BackupResult<Vec<String>> {
        let mut tables = Vec::new();
        for entry in sql::schema_entries(self.db)? {
            if self.rules.is_fts_shadow(&entry.name) {
                debug!(name = %entry.name, "skipping full-text shadow table");
                continue;
            }
            if entry.is_table() {
                tables.push(entry.name.clone());
            }
            writer.write_frame(&BackupFrame::SqlStatement {
                text: entry.sql,
                parameters: Vec::new(),
            })?;
        }
        Ok(tables)
    }

    fn plan(&self, table: &str) -> Option<(RowFilter<'_>, Payload)> {
        if !self.rules.is_exportable(table) {
            return None;
        }
        if self.rules.is_attachment_table(table) {
            let a = &self.rules.attachment_table;
            let filter = RowFilter::Dependent {
                message_column: &a.message_column,
                owner: &a.owner,
            };
            return Some((filter, Payload::Attachment));
        }
        if self.rules.is_sticker_table(table) {
            return Some((RowFilter::All, Payload::Sticker));
        }
        if let Some(m) = self.rules.message_table(table) {
            return Some((RowFilter::Message(m), Payload::None));
        }
        if let Some(d) = self.rules.dependent_table(table) {
            let filter = RowFilter::Dependent {
                message_column: &d.message_column,
                owner: &d.owner,
            };
            return Some((filter, Payload::None));
        }
        Some((RowFilter::All, Payload::None))
    }

    fn export_table<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        table: &str,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        let Some((filter, payload)) = self.plan(table) else {
            debug!(table, "skipping table contents");
            return Ok(());
        };

        let query = format!("SELECT * FROM {}", quote_ident(table));
        sql::for_each_row(self.db, &query, &[], |columns, cells| {
            check_cancelled(cancel)?;
            if !self.row_is_eligible(&filter, columns, cells)? {
                return Ok(());
            }

            progress.step();
            writer.write_frame(&BackupFrame::SqlStatement {
                text: sql::insert_statement(table, cells.len()),
                parameters: cells.to_vec(),
            })?;

            match payload {
                Payload::Attachment => self.export_attachment(writer, columns, cells, progress),
                Payload::Sticker => self.export_sticker(writer, columns, cells, progress),
                Payload::None => Ok(()),
            }
        })
    }

    fn row_is_eligible(
        &self,
        filter: &RowFilter<'_>,
        columns: &Columns,
        cells: &[SqlParameter],
    ) -> BackupResult<bool> {
        match filter {
            RowFilter::All => Ok(true),
            RowFilter::Message(table) => is_non_expiring(table, columns, cells),
            RowFilter::Dependent {
                message_column,
                owner,
            } => {
                let message_id = cells[columns.index_of(message_column)?].as_i64();
                let owner_table = match owner {
                    MessageOwner::Table { owner } => owner.as_str(),
                    MessageOwner::Flag { flag_column, .. } => {
                        owner.resolve(cells[columns.index_of(flag_column)?].as_i64() != 0)
                    }
                };
                self.message_is_non_expiring(owner_table, message_id)
            }
        }
    }

    /// False when the owning message row is missing.
    fn message_is_non_expiring(&self, owner: &str, message_id: i64) -> BackupResult<bool> {
        let Some(table) = self.rules.message_table(owner) else {
            return Ok(true);
        };
        if !sql::table_exists(self.db, &table.table)? {
            return Ok(false);
        }

        let query = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(&table.table),
            quote_ident(&table.id_column)
        );
        let mut eligible = false;
        sql::for_each_row(
            self.db,
            &query,
            &[SqlParameter::Integer(message_id)],
            |columns, cells| {
                eligible = is_non_expiring(table, columns, cells)?;
                Ok(())
            },
        )?;
        Ok(eligible)
    }

    fn export_attachment<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        columns: &Columns,
        cells: &[SqlParameter],
        progress: &mut Progress<'_>,
    ) -> BackupResult<()> {
        let t = &self.rules.attachment_table;
        let row_id = cells[columns.index_of(&t.row_id_column)?].as_i64();
        let unique_id = cells[columns.index_of(&t.unique_id_column)?].as_i64();
        let mut size = cells[columns.index_of(&t.size_column)?].as_i64();
        let data = cells[columns.index_of(&t.data_column)?]
            .as_str()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let random = cells[columns.index_of(&t.random_column)?].as_blob();

        if let Some(path) = &data {
            let on_disk = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if size <= 0 || u64::try_from(size).ok() != Some(on_disk) {
                let measured = self.measure_part(path, random);
                warn!(row_id, declared = size, measured, "recomputed attachment length from stored data");
                size = measured;
            }
        }

        progress.step();

        let Some(path) = data else {
            return Ok(());
        };
        if size <= 0 {
            return Ok(());
        }
        match self.blobs.open_part(&path, random) {
            Ok(source) => writer.write_attachment(row_id, unique_id, source, size as u64),
            Err(e) if is_unreadable(&e) => {
                warn!(row_id, path = %path.display(), error = %e, "skipping attachment payload");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn export_sticker<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        columns: &Columns,
        cells: &[SqlParameter],
        progress: &mut Progress<'_>,
    ) -> BackupResult<()> {
        let t = &self.rules.sticker_table;
        let row_id = cells[columns.index_of(&t.id_column)?].as_i64();
        let size = cells[columns.index_of(&t.length_column)?].as_i64();
        let random = cells[columns.index_of(&t.random_column)?].as_blob();
        let path = match cells[columns.index_of(&t.path_column)?].as_str() {
            Some(p) if !p.is_empty() && size > 0 => PathBuf::from(p),
            _ => return Ok(()),
        };

        progress.step();
        match self.blobs.open_part(&path, random) {
            Ok(source) => writer.write_sticker(row_id, source, size as u64),
            Err(e) if is_unreadable(&e) => {
                warn!(row_id, path = %path.display(), error = %e, "skipping sticker payload");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Plaintext length of a stored part, 0 when it cannot be read.
    fn measure_part(&self, path: &Path, random: Option<&[u8]>) -> i64 {
        let measured = self.blobs.open_part(path, random).and_then(|mut source| {
            Ok(std::io::copy(&mut source, &mut std::io::sink())?)
        });
        match measured {
            Ok(n) => i64::try_from(n).unwrap_or(i64::MAX),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot measure attachment");
                0
            }
        }
    }

    fn export_preferences<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        for pref in &self.preference_keys {
            check_cancelled(cancel)?;
            let Some(value) = self.preferences.get(&pref.file, &pref.key) else {
                continue;
            };
            progress.step();
            writer.write_frame(&BackupFrame::SharedPreference {
                file: pref.file.clone(),
                key: pref.key.clone(),
                value: Some(value.clone()),
            })?;
        }
        Ok(())
    }

    fn export_key_values<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        for key in &self.key_value_keys {
            check_cancelled(cancel)?;
            let Some(value) = self.key_values.get(key)? else {
                debug!(key = %key, "key not present, skipping");
                continue;
            };
            progress.step();
            writer.write_frame(&BackupFrame::KeyValue {
                key: key.clone(),
                value: Some(value),
            })?;
        }
        Ok(())
    }

    fn export_avatars<W: Write>(
        &self,
        writer: &mut FrameWriter<W>,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
    ) -> BackupResult<()> {
        for avatar in self.blobs.avatars()? {
            check_cancelled(cancel)?;
            progress.step();
            match self.blobs.open_avatar(&avatar.recipient_id) {
                Ok(source) => writer.write_avatar(&avatar.recipient_id, source, avatar.length)?,
                Err(e) if is_unreadable(&e) => {
                    warn!(recipient_id = %avatar.recipient_id, error = %e, "skipping avatar");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn estimate_for(&self, tables: &[String]) -> BackupResult<u64> {
        let mut total = 1 + 3 * tables.len() as u64;
        for table in tables {
            total += self.count_eligible(table)?;
        }
        total += IDENTITY_FRAMES;
        total += self
            .preference_keys
            .iter()
            .filter(|p| self.preferences.get(&p.file, &p.key).is_some())
            .count() as u64;
        for key in &self.key_value_keys {
            if self.key_values.contains(key)? {
                total += 1;
            }
        }
        total += self.blobs.avatars()?.len() as u64;
        Ok(total + 1)
    }

    /// `COUNT(*)` of the rows [`Self::row_is_eligible`] would accept.
    fn count_eligible(&self, table: &str) -> BackupResult<u64> {
        let Some((filter, _)) = self.plan(table) else {
            return Ok(0);
        };
        let t = quote_ident(table);
        let query = match filter {
            RowFilter::All => format!("SELECT COUNT(*) FROM {t}"),
            RowFilter::Message(m) => format!(
                "SELECT COUNT(*) FROM {t} WHERE {}",
                non_expiring_clause(m, &t)
            ),
            RowFilter::Dependent {
                message_column,
                owner,
            } => {
                let message_ref = format!("{t}.{}", quote_ident(message_column));
                match owner {
                    MessageOwner::Table { owner } => format!(
                        "SELECT COUNT(*) FROM {t} WHERE {}",
                        self.owner_clause(owner, &message_ref)?
                    ),
                    MessageOwner::Flag {
                        flag_column,
                        when_set,
                        when_unset,
                    } => {
                        let flag = format!("COALESCE({t}.{}, 0)", quote_ident(flag_column));
                        format!(
                            "SELECT COUNT(*) FROM {t} WHERE ({flag} != 0 AND {}) OR ({flag} = 0 AND {})",
                            self.owner_clause(when_set, &message_ref)?,
                            self.owner_clause(when_unset, &message_ref)?
                        )
                    }
                }
            }
        };
        Ok(sql::count(self.db, &query, &[])?.max(0) as u64)
    }

    fn owner_clause(&self, owner: &str, message_ref: &str) -> BackupResult<String> {
        let Some(m) = self.rules.message_table(owner) else {
            return Ok("1".into());
        };
        if !sql::table_exists(self.db, &m.table)? {
            return Ok("0".into());
        }
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} AS owner_row WHERE owner_row.{} = {message_ref} AND {})",
            quote_ident(&m.table),
            quote_ident(&m.id_column),
            non_expiring_clause(m, "owner_row")
        ))
    }
}

fn check_cancelled(cancel: &CancellationToken) -> BackupResult<()> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled);
    }
    Ok(())
}

/// A missing or undecryptable stored file loses its payload, not the export.
fn is_unreadable(err: &BackupError) -> bool {
    match err {
        BackupError::Io(e) => e.kind() == ErrorKind::NotFound,
        BackupError::Crypto(_) | BackupError::Malformed(_) => true,
        _ => false,
    }
}

fn is_non_expiring(
    table: &MessageTable,
    columns: &Columns,
    cells: &[SqlParameter],
) -> BackupResult<bool> {
    let expires = cells[columns.index_of(&table.expires_column)?].as_i64();
    let view_once = match &table.view_once_column {
        Some(column) => cells[columns.index_of(column)?].as_i64(),
        None => 0,
    };
    Ok(expires <= 0 && view_once <= 0)
}

fn non_expiring_clause(table: &MessageTable, alias: &str) -> String {
    let mut clause = format!(
        "COALESCE({alias}.{}, 0) <= 0",
        quote_ident(&table.expires_column)
    );
    if let Some(column) = &table.view_once_column {
        clause.push_str(&format!(" AND COALESCE({alias}.{}, 0) <= 0", quote_ident(column)));
    }
    clause
}
