pub mod config;
pub mod error;
pub mod rules;
pub mod types;

pub use error::{BackupError, BackupResult};
pub use rules::TableRules;
pub use types::{BackupEvent, BackupEventKind, KeyValueValue, PreferenceValue, SqlParameter};
