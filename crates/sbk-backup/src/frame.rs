//! The frame union and its mapping onto the wire messages.

use sbk_core::{BackupError, BackupResult, KeyValueValue, PreferenceValue, SqlParameter};

use crate::proto;

/// One unit of the backup stream. Exactly one payload per frame; the
/// `Attachment`, `Sticker` and `Avatar` variants announce a streamed payload
/// of `length` plaintext bytes that immediately follows the frame.
#[derive(Debug, Clone, PartialEq)]
pub enum BackupFrame {
    Header {
        iv: [u8; 16],
        salt: Vec<u8>,
    },
    DatabaseVersion(i32),
    SqlStatement {
        text: String,
        parameters: Vec<SqlParameter>,
    },
    SharedPreference {
        file: String,
        key: String,
        value: Option<PreferenceValue>,
    },
    KeyValue {
        key: String,
        value: Option<KeyValueValue>,
    },
    Attachment {
        row_id: i64,
        unique_id: i64,
        length: u32,
    },
    Sticker {
        row_id: i64,
        length: u32,
    },
    Avatar {
        /// Legacy identifier, only consulted when `recipient_id` is absent
        name: Option<String>,
        recipient_id: Option<String>,
        length: u32,
    },
    End,
}

impl BackupFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            BackupFrame::Header { .. } => "header",
            BackupFrame::DatabaseVersion(_) => "version",
            BackupFrame::SqlStatement { .. } => "statement",
            BackupFrame::SharedPreference { .. } => "preference",
            BackupFrame::KeyValue { .. } => "key_value",
            BackupFrame::Attachment { .. } => "attachment",
            BackupFrame::Sticker { .. } => "sticker",
            BackupFrame::Avatar { .. } => "avatar",
            BackupFrame::End => "end",
        }
    }

    /// Length of the streamed payload following this frame, if any.
    pub fn payload_length(&self) -> Option<u32> {
        match self {
            BackupFrame::Attachment { length, .. }
            | BackupFrame::Sticker { length, .. }
            | BackupFrame::Avatar { length, .. } => Some(*length),
            _ => None,
        }
    }

    pub fn to_proto(&self) -> proto::BackupFrame {
        let mut frame = proto::BackupFrame::default();
        match self {
            BackupFrame::Header { iv, salt } => {
                frame.header = Some(proto::Header {
                    iv: Some(iv.to_vec()),
                    salt: Some(salt.clone()),
                });
            }
            BackupFrame::DatabaseVersion(version) => {
                frame.version = Some(proto::DatabaseVersion {
                    version: Some(*version as u32),
                });
            }
            BackupFrame::SqlStatement { text, parameters } => {
                frame.statement = Some(proto::SqlStatement {
                    statement: Some(text.clone()),
                    parameters: parameters.iter().map(parameter_to_proto).collect(),
                });
            }
            BackupFrame::SharedPreference { file, key, value } => {
                let mut pref = proto::SharedPreference {
                    file: Some(file.clone()),
                    key: Some(key.clone()),
                    ..Default::default()
                };
                match value {
                    Some(PreferenceValue::String(s)) => pref.value = Some(s.clone()),
                    Some(PreferenceValue::Bool(b)) => pref.boolean_value = Some(*b),
                    Some(PreferenceValue::StringSet(set)) => {
                        pref.string_set_value = set.iter().cloned().collect();
                        pref.is_string_set_value = Some(true);
                    }
                    None => {}
                }
                frame.preference = Some(pref);
            }
            BackupFrame::KeyValue { key, value } => {
                let mut kv = proto::KeyValue {
                    key: Some(key.clone()),
                    ..Default::default()
                };
                match value {
                    Some(KeyValueValue::Blob(b)) => kv.blob_value = Some(b.clone()),
                    Some(KeyValueValue::Bool(b)) => kv.boolean_value = Some(*b),
                    Some(KeyValueValue::Float(f)) => kv.float_value = Some(*f),
                    Some(KeyValueValue::Integer(i)) => kv.integer_value = Some(*i),
                    Some(KeyValueValue::Long(l)) => kv.long_value = Some(*l),
                    Some(KeyValueValue::String(s)) => kv.string_value = Some(s.clone()),
                    None => {}
                }
                frame.key_value = Some(kv);
            }
            BackupFrame::Attachment {
                row_id,
                unique_id,
                length,
            } => {
                frame.attachment = Some(proto::Attachment {
                    row_id: Some(*row_id as u64),
                    attachment_id: Some(*unique_id as u64),
                    length: Some(*length),
                });
            }
            BackupFrame::Sticker { row_id, length } => {
                frame.sticker = Some(proto::Sticker {
                    row_id: Some(*row_id as u64),
                    length: Some(*length),
                });
            }
            BackupFrame::Avatar {
                name,
                recipient_id,
                length,
            } => {
                frame.avatar = Some(proto::Avatar {
                    name: name.clone(),
                    recipient_id: recipient_id.clone(),
                    length: Some(*length),
                });
            }
            BackupFrame::End => frame.end = Some(true),
        }
        frame
    }

    /// Map a decoded wire message onto the union. `Ok(None)` means the frame
    /// carries no payload this version understands.
    pub fn from_proto(frame: proto::BackupFrame) -> BackupResult<Option<Self>> {
        if frame.end == Some(true) {
            return Ok(Some(BackupFrame::End));
        }
        if let Some(header) = frame.header {
            return header_from_proto(header).map(Some);
        }
        if let Some(version) = frame.version {
            return Ok(Some(BackupFrame::DatabaseVersion(
                version.version.unwrap_or_default() as i32,
            )));
        }
        if let Some(statement) = frame.statement {
            return Ok(Some(BackupFrame::SqlStatement {
                text: statement.statement.unwrap_or_default(),
                parameters: statement
                    .parameters
                    .into_iter()
                    .filter_map(parameter_from_proto)
                    .collect(),
            }));
        }
        if let Some(pref) = frame.preference {
            let value = if let Some(s) = pref.value {
                Some(PreferenceValue::String(s))
            } else if let Some(b) = pref.boolean_value {
                Some(PreferenceValue::Bool(b))
            } else if pref.is_string_set_value == Some(true) {
                Some(PreferenceValue::StringSet(
                    pref.string_set_value.into_iter().collect(),
                ))
            } else {
                None
            };
            return Ok(Some(BackupFrame::SharedPreference {
                file: pref.file.unwrap_or_default(),
                key: pref.key.unwrap_or_default(),
                value,
            }));
        }
        if let Some(a) = frame.attachment {
            return Ok(Some(BackupFrame::Attachment {
                row_id: a.row_id.unwrap_or_default() as i64,
                unique_id: a.attachment_id.unwrap_or_default() as i64,
                length: a.length.unwrap_or_default(),
            }));
        }
        if let Some(s) = frame.sticker {
            return Ok(Some(BackupFrame::Sticker {
                row_id: s.row_id.unwrap_or_default() as i64,
                length: s.length.unwrap_or_default(),
            }));
        }
        if let Some(a) = frame.avatar {
            return Ok(Some(BackupFrame::Avatar {
                name: a.name,
                recipient_id: a.recipient_id,
                length: a.length.unwrap_or_default(),
            }));
        }
        if let Some(kv) = frame.key_value {
            let value = if let Some(b) = kv.blob_value {
                Some(KeyValueValue::Blob(b))
            } else if let Some(b) = kv.boolean_value {
                Some(KeyValueValue::Bool(b))
            } else if let Some(f) = kv.float_value {
                Some(KeyValueValue::Float(f))
            } else if let Some(i) = kv.integer_value {
                Some(KeyValueValue::Integer(i))
            } else if let Some(l) = kv.long_value {
                Some(KeyValueValue::Long(l))
            } else {
                kv.string_value.map(KeyValueValue::String)
            };
            return Ok(Some(BackupFrame::KeyValue {
                key: kv.key.unwrap_or_default(),
                value,
            }));
        }
        Ok(None)
    }
}

fn header_from_proto(header: proto::Header) -> BackupResult<BackupFrame> {
    let iv = header
        .iv
        .ok_or_else(|| BackupError::Malformed("header without IV".into()))?;
    let iv: [u8; 16] = iv
        .as_slice()
        .try_into()
        .map_err(|_| BackupError::Malformed(format!("invalid IV length {}", iv.len())))?;
    let salt = header
        .salt
        .ok_or_else(|| BackupError::Malformed("header without salt".into()))?;
    Ok(BackupFrame::Header { iv, salt })
}

fn parameter_to_proto(param: &SqlParameter) -> proto::SqlParameter {
    let mut p = proto::SqlParameter::default();
    match param {
        SqlParameter::String(s) => p.string_paramter = Some(s.clone()),
        SqlParameter::Double(d) => p.double_parameter = Some(*d),
        SqlParameter::Integer(i) => p.integer_parameter = Some(*i as u64),
        SqlParameter::Blob(b) => p.blob_parameter = Some(b.clone()),
        SqlParameter::Null => p.nullparameter = Some(true),
    }
    p
}

/// A parameter with no field set is dropped, as earlier readers did.
fn parameter_from_proto(p: proto::SqlParameter) -> Option<SqlParameter> {
    if let Some(s) = p.string_paramter {
        Some(SqlParameter::String(s))
    } else if let Some(d) = p.double_parameter {
        Some(SqlParameter::Double(d))
    } else if let Some(i) = p.integer_parameter {
        Some(SqlParameter::Integer(i as i64))
    } else if let Some(b) = p.blob_parameter {
        Some(SqlParameter::Blob(b))
    } else if p.nullparameter.is_some() {
        Some(SqlParameter::Null)
    } else {
        tracing::debug!("dropping SQL parameter with no value");
        None
    }
}
