use std::collections::BTreeMap;
use std::io::Read;

use sbk_core::BackupResult;
use tracing::warn;

use crate::frame::BackupFrame;
use crate::reader::FrameReader;

/// Frame census of a backup, gathered without touching any store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectReport {
    pub database_version: Option<i32>,
    /// Frame count per kind, `end` included
    pub frames: BTreeMap<&'static str, u64>,
    /// CREATE TABLE statements seen, by table name
    pub tables: Vec<String>,
    pub payload_bytes: u64,
    pub bad_payloads: u64,
}

impl InspectReport {
    pub fn total_frames(&self) -> u64 {
        self.frames.values().sum()
    }
}

/// Decrypt and authenticate a whole backup, discarding every payload.
pub fn inspect<R: Read>(mut reader: FrameReader<R>) -> BackupResult<InspectReport> {
    let mut report = InspectReport::default();
    loop {
        let frame = reader.read_frame()?;
        *report.frames.entry(frame.kind()).or_default() += 1;

        match &frame {
            BackupFrame::DatabaseVersion(v) => report.database_version = Some(*v),
            BackupFrame::SqlStatement { text, parameters } if parameters.is_empty() => {
                if let Some(name) = created_table(text) {
                    report.tables.push(name);
                }
            }
            BackupFrame::End => return Ok(report),
            _ => {}
        }

        if let Some(length) = frame.payload_length() {
            match reader.skip_payload(length) {
                Ok(()) => report.payload_bytes += u64::from(length),
                Err(e) if e.is_recoverable() => {
                    warn!(kind = frame.kind(), length, "payload failed authentication");
                    report.bad_payloads += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Table name of a `CREATE TABLE` statement, unquoted.
fn created_table(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("create") {
        return None;
    }
    let mut word = words.next()?;
    if word.eq_ignore_ascii_case("virtual") {
        word = words.next()?;
    }
    if !word.eq_ignore_ascii_case("table") {
        return None;
    }
    let mut name = words.next()?;
    if name.eq_ignore_ascii_case("if") {
        // IF NOT EXISTS
        words.next()?;
        words.next()?;
        name = words.next()?;
    }
    let name = name.split('(').next().unwrap_or(name);
    Some(name.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string())
}
