//! sbk-crypto: cryptography for the sbk backup container
//!
//! Key hierarchy:
//! ```text
//! Passphrase + salt(32)
//!   └── Backup Key (256-bit, IteratedSha512 or Argon2id)
//!         └── HKDF-SHA256(info="Backup Export") → 64 bytes
//!               ├── Cipher Key (AES-256-CTR, IV = counter(4) ‖ fixed(12))
//!               └── MAC Key    (HMAC-SHA256, truncated to 10 bytes)
//! ```
//!
//! At-rest attachments are encrypted independently of any backup with an
//! [`AttachmentSecret`], in either the modern or the classic part format.

pub mod at_rest;
pub mod kdf;
pub mod keys;
pub mod session;

pub use at_rest::{
    decryptor_for, ClassicPartDecryptor, CtrReader, CtrWriter, ModernPartDecryptor,
    PartDecryptor,
};
pub use kdf::{Argon2idKdf, BackupKey, IteratedSha512, KdfParams, PassphraseKdf};
pub use keys::{derive_session_keys, AttachmentSecret, SessionKeys};
pub use session::{CipherSession, PayloadOpener, PayloadSealer};

/// Size of every symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the passphrase salt carried in the header frame
pub const SALT_SIZE: usize = 32;

/// Size of the AES-CTR IV / counter block
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tags are truncated to this many bytes on the wire
pub const TRUNCATED_MAC_LEN: usize = 10;

/// Chunk size for streamed payloads
pub const BUFFER_SIZE: usize = 8192;

pub(crate) type HmacSha256 = hmac::Hmac<sha2::Sha256>;
pub(crate) type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
