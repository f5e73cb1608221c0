use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::rules::TableRules;

/// Top-level configuration (loaded from sbk.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbkConfig {
    pub log: LogConfig,
    pub store: StoreConfig,
    pub kdf: KdfConfig,
    pub backup: BackupConfig,
    pub tables: TableRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Locations of the local stores a backup is taken from or restored into
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Relational database (SQLite)
    pub database: PathBuf,
    /// Structured key/value settings database (SQLite)
    pub key_value_database: PathBuf,
    /// Legacy flat preference files (JSON)
    pub preferences: PathBuf,
    /// Root of the encrypted blob directories (attachments, stickers, avatars)
    pub blob_dir: PathBuf,
    /// At-rest attachment secret (base64 JSON)
    pub attachment_secret: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    /// Iterated SHA-512, the container's native passphrase derivation
    Sha512,
    Argon2id,
}

/// Passphrase → backup key derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub algorithm: KdfAlgorithm,
    /// Rounds for the iterated SHA-512 derivation (default: 250000)
    pub sha512_iterations: u32,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

/// A `{file, key}` pair naming one legacy flat preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceKey {
    pub file: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Flat preferences included in an export
    pub preferences: Vec<PreferenceKey>,
    /// Structured settings keys included in an export (skipped when absent)
    pub key_values: Vec<String>,
    /// Import progress cadence, in frames
    pub progress_interval: u64,
    /// Upper bound for a single encrypted frame, in bytes
    pub max_frame_length: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("~/.local/share/sbk/app.db"),
            key_value_database: PathBuf::from("~/.local/share/sbk/key_value.db"),
            preferences: PathBuf::from("~/.local/share/sbk/preferences.json"),
            blob_dir: PathBuf::from("~/.local/share/sbk/blobs"),
            attachment_secret: PathBuf::from("~/.config/sbk/attachment_secret.json"),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Sha512,
            sha512_iterations: 250_000,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        let pref = |key: &str| PreferenceKey {
            file: "app_preferences".into(),
            key: key.into(),
        };
        Self {
            preferences: vec![
                pref("pref_theme"),
                pref("pref_language"),
                pref("pref_message_body_text_size"),
                pref("pref_system_emoji"),
                pref("pref_enter_sends"),
                pref("pref_led_color"),
                pref("pref_key_ringtone"),
            ],
            key_values: [
                "account.aci_identity_public_key",
                "account.aci_identity_private_key",
                "account.pni_identity_public_key",
                "account.pni_identity_private_key",
                "kbs.pin_reminders_enabled",
                "settings.theme",
                "settings.message_font_size",
                "settings.language",
                "settings.prefer_system_contact_photos",
                "settings.link_previews",
                "emoji.recent",
                "misc.user_display_name",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            progress_interval: 100,
            max_frame_length: 128 * 1024 * 1024,
        }
    }
}
