use thiserror::Error;

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Truncated stream or a failing reader/writer underneath the codec.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid stream: bad length field, missing header material.
    #[error("malformed backup stream: {0}")]
    Malformed(String),

    /// Whole-frame MAC mismatch. The stream cannot be resynchronised.
    #[error("frame authentication failed (bad MAC)")]
    FrameAuthentication,

    /// Streamed payload MAC mismatch. The payload bytes were fully consumed.
    #[error("payload authentication failed (bad MAC)")]
    PayloadAuthentication,

    #[error("backup operation cancelled")]
    Cancelled,

    #[error("tried to import a backup with version {backup} into a database with version {local}")]
    Downgrade { local: i32, backup: i32 },

    #[error("size mismatch: declared {expected} bytes, streamed {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("payload length {0} does not fit the frame length field")]
    LengthOverflow(u64),

    #[error("unknown value type: {0}")]
    UnknownType(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("frame decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackupError {
    /// Only a streamed payload MAC failure may be absorbed by the importer;
    /// every other kind aborts the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackupError::PayloadAuthentication)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }
}
