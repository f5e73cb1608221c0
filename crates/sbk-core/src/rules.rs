//! Table rules: which tables are exported, which rows qualify, and which
//! tables carry streamed binary payloads.
//!
//! Defaults describe the messenger schema the container format was built for.
//! A deployment with a different schema overrides them in the `[tables]`
//! section of `sbk.toml`.

use serde::{Deserialize, Serialize};

/// A table holding messages that may carry a disappearing-message timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTable {
    pub table: String,
    pub id_column: String,
    pub expires_column: String,
    /// Present only for tables that support view-once media
    #[serde(default)]
    pub view_once_column: Option<String>,
}

/// Which message table a dependent row points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageOwner {
    /// Always the same message table
    Table { owner: String },
    /// A boolean column chooses between two message tables
    Flag {
        flag_column: String,
        when_set: String,
        when_unset: String,
    },
}

impl MessageOwner {
    pub fn fixed(table: &str) -> Self {
        MessageOwner::Table {
            owner: table.to_string(),
        }
    }

    /// Resolve the owning table for a row given its flag value (ignored for
    /// fixed owners).
    pub fn resolve(&self, flag: bool) -> &str {
        match self {
            MessageOwner::Table { owner } => owner,
            MessageOwner::Flag {
                when_set,
                when_unset,
                ..
            } => {
                if flag {
                    when_set
                } else {
                    when_unset
                }
            }
        }
    }
}

/// A table whose rows belong to a message row (reactions, mentions, receipts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentTable {
    pub table: String,
    pub message_column: String,
    #[serde(flatten)]
    pub owner: MessageOwner,
}

/// Attachment metadata: a dependent table whose rows also reference an
/// encrypted blob on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTable {
    pub table: String,
    pub row_id_column: String,
    pub unique_id_column: String,
    pub size_column: String,
    pub data_column: String,
    pub random_column: String,
    pub message_column: String,
    #[serde(flatten)]
    pub owner: MessageOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerTable {
    pub table: String,
    pub id_column: String,
    pub path_column: String,
    pub length_column: String,
    pub random_column: String,
}

/// A historical table/column holding an avatar reference, nulled when an
/// avatar frame arrives without a recipient id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAvatarColumn {
    pub table: String,
    pub avatar_column: String,
    pub match_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableRules {
    pub message_tables: Vec<MessageTable>,
    pub dependent_tables: Vec<DependentTable>,
    pub attachment_table: AttachmentTable,
    pub sticker_table: StickerTable,
    /// Tables whose contents never leave the device
    pub denylist: Vec<String>,
    /// Full-text tables; their `<name>_*` shadow tables are never exported or imported
    pub fts_tables: Vec<String>,
    /// Tables with foreign-key-sensitive ordering, dropped before the general sweep
    pub drop_first: Vec<String>,
    pub legacy_avatar_columns: Vec<LegacyAvatarColumn>,
}

impl TableRules {
    pub fn message_table(&self, name: &str) -> Option<&MessageTable> {
        self.message_tables.iter().find(|t| t.table == name)
    }

    pub fn dependent_table(&self, name: &str) -> Option<&DependentTable> {
        self.dependent_tables.iter().find(|t| t.table == name)
    }

    pub fn is_attachment_table(&self, name: &str) -> bool {
        self.attachment_table.table == name
    }

    pub fn is_sticker_table(&self, name: &str) -> bool {
        self.sticker_table.table == name
    }

    /// Internal SQLite bookkeeping tables (`sqlite_sequence`, `sqlite_stat1`, ...)
    pub fn is_internal(name: &str) -> bool {
        name.starts_with("sqlite_")
    }

    pub fn is_denylisted(&self, name: &str) -> bool {
        self.denylist.iter().any(|t| t == name)
    }

    /// True for the hidden shadow tables of a full-text index
    /// (`sms_fts_data`, `sms_fts_config`, ...), not for the index table itself.
    pub fn is_fts_shadow(&self, name: &str) -> bool {
        self.fts_tables
            .iter()
            .any(|fts| name != fts && name.starts_with(fts.as_str()))
    }

    /// True when an incoming schema statement recreates a full-text shadow
    /// table or a raw SQLite system table.
    pub fn is_ignored_statement(&self, sql: &str) -> bool {
        let shadow = self
            .fts_tables
            .iter()
            .any(|fts| sql.contains(&format!("{fts}_")));
        shadow || sql.to_lowercase().starts_with("create table sqlite_")
    }

    /// Whether a table's rows are exported at all.
    pub fn is_exportable(&self, name: &str) -> bool {
        !Self::is_internal(name) && !self.is_denylisted(name)
    }
}

impl Default for TableRules {
    fn default() -> Self {
        Self {
            message_tables: vec![
                MessageTable {
                    table: "sms".into(),
                    id_column: "_id".into(),
                    expires_column: "expires_in".into(),
                    view_once_column: None,
                },
                MessageTable {
                    table: "mms".into(),
                    id_column: "_id".into(),
                    expires_column: "expires_in".into(),
                    view_once_column: Some("view_once".into()),
                },
            ],
            dependent_tables: vec![
                DependentTable {
                    table: "reaction".into(),
                    message_column: "message_id".into(),
                    owner: MessageOwner::Flag {
                        flag_column: "is_mms".into(),
                        when_set: "mms".into(),
                        when_unset: "sms".into(),
                    },
                },
                DependentTable {
                    table: "mention".into(),
                    message_column: "message_id".into(),
                    owner: MessageOwner::fixed("mms"),
                },
                DependentTable {
                    table: "group_receipts".into(),
                    message_column: "mms_id".into(),
                    owner: MessageOwner::fixed("mms"),
                },
            ],
            attachment_table: AttachmentTable {
                table: "part".into(),
                row_id_column: "_id".into(),
                unique_id_column: "unique_id".into(),
                size_column: "data_size".into(),
                data_column: "_data".into(),
                random_column: "data_random".into(),
                message_column: "mid".into(),
                owner: MessageOwner::fixed("mms"),
            },
            sticker_table: StickerTable {
                table: "sticker".into(),
                id_column: "_id".into(),
                path_column: "file_path".into(),
                length_column: "file_length".into(),
                random_column: "file_random".into(),
            },
            denylist: [
                "signed_prekeys",
                "one_time_prekeys",
                "sessions",
                "sms_fts",
                "mms_fts",
                "emoji_search",
                "sender_keys",
                "sender_key_shared",
                "pending_retry_receipts",
                "avatar_picker",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            fts_tables: ["sms_fts", "mms_fts", "emoji_search"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            drop_first: [
                "distribution_list_member",
                "distribution_list",
                "message_send_log_recipients",
                "msl_recipient",
                "msl_message",
                "reaction",
                "notification_profile_schedule",
                "notification_profile_allowed_members",
                "story_sends",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            legacy_avatar_columns: vec![
                LegacyAvatarColumn {
                    table: "recipient_preferences".into(),
                    avatar_column: "signal_profile_avatar".into(),
                    match_column: "recipient_ids".into(),
                },
                LegacyAvatarColumn {
                    table: "recipient".into(),
                    avatar_column: "signal_profile_avatar".into(),
                    match_column: "phone".into(),
                },
            ],
        }
    }
}
