//! Key hierarchy: backup key → session keys, and the at-rest attachment secret

use std::path::Path;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::BackupKey;
use crate::KEY_SIZE;

/// HKDF info string binding derived keys to the backup container
const EXPORT_INFO: &[u8] = b"Backup Export";

/// Cipher and MAC keys for one backup session. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKeys {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl SessionKeys {
    pub fn from_parts(cipher_key: [u8; KEY_SIZE], mac_key: [u8; KEY_SIZE]) -> Self {
        Self { cipher_key, mac_key }
    }

    pub fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher_key
    }

    pub fn mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.mac_key
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("cipher_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

/// Expand the backup key via HKDF-SHA256 (no salt) into 64 bytes and split
/// them into the cipher key and the MAC key.
pub fn derive_session_keys(backup_key: &BackupKey) -> anyhow::Result<SessionKeys> {
    let hkdf = Hkdf::<Sha256>::new(None, backup_key.as_bytes());
    let mut okm = [0u8; KEY_SIZE * 2];
    hkdf.expand(EXPORT_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;

    let mut cipher_key = [0u8; KEY_SIZE];
    let mut mac_key = [0u8; KEY_SIZE];
    cipher_key.copy_from_slice(&okm[..KEY_SIZE]);
    mac_key.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    Ok(SessionKeys::from_parts(cipher_key, mac_key))
}

/// Device-local secret protecting attachment, sticker and avatar files at rest.
///
/// The classic keys serve the legacy `[IV][ciphertext][HMAC]` part format;
/// the modern key is combined with each file's 32-byte random.
#[derive(Clone)]
pub struct AttachmentSecret {
    classic_cipher_key: [u8; KEY_SIZE],
    classic_mac_key: [u8; KEY_SIZE],
    modern_key: [u8; KEY_SIZE],
}

#[derive(Serialize, Deserialize)]
struct AttachmentSecretFile {
    #[serde(rename = "classicCipherKey")]
    classic_cipher_key: String,
    #[serde(rename = "classicMacKey")]
    classic_mac_key: String,
    #[serde(rename = "modernKey")]
    modern_key: String,
}

impl AttachmentSecret {
    pub fn new(
        classic_cipher_key: [u8; KEY_SIZE],
        classic_mac_key: [u8; KEY_SIZE],
        modern_key: [u8; KEY_SIZE],
    ) -> Self {
        Self {
            classic_cipher_key,
            classic_mac_key,
            modern_key,
        }
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut secret = Self::new([0u8; KEY_SIZE], [0u8; KEY_SIZE], [0u8; KEY_SIZE]);
        rng.fill_bytes(&mut secret.classic_cipher_key);
        rng.fill_bytes(&mut secret.classic_mac_key);
        rng.fill_bytes(&mut secret.modern_key);
        secret
    }

    pub fn classic_cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.classic_cipher_key
    }

    pub fn classic_mac_key(&self) -> &[u8; KEY_SIZE] {
        &self.classic_mac_key
    }

    pub fn modern_key(&self) -> &[u8; KEY_SIZE] {
        &self.modern_key
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let file = AttachmentSecretFile {
            classic_cipher_key: STANDARD.encode(self.classic_cipher_key),
            classic_mac_key: STANDARD.encode(self.classic_mac_key),
            modern_key: STANDARD.encode(self.modern_key),
        };
        serde_json::to_string_pretty(&file).context("serializing attachment secret")
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: AttachmentSecretFile =
            serde_json::from_str(json).context("parsing attachment secret")?;
        Ok(Self::new(
            decode_key("classicCipherKey", &file.classic_cipher_key)?,
            decode_key("classicMacKey", &file.classic_mac_key)?,
            decode_key("modernKey", &file.modern_key)?,
        ))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading attachment secret: {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Write the secret atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json()?)
            .with_context(|| format!("writing attachment secret: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming attachment secret to {}", path.display()))?;
        Ok(())
    }
}

fn decode_key(field: &str, encoded: &str) -> anyhow::Result<[u8; KEY_SIZE]> {
    let mut bytes = STANDARD
        .decode(encoded)
        .with_context(|| format!("{field}: invalid base64"))?;
    if bytes.len() != KEY_SIZE {
        let len = bytes.len();
        bytes.zeroize();
        anyhow::bail!("{field}: expected {KEY_SIZE} bytes, got {len}");
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

impl Drop for AttachmentSecret {
    fn drop(&mut self) {
        self.classic_cipher_key.zeroize();
        self.classic_mac_key.zeroize();
        self.modern_key.zeroize();
    }
}

impl std::fmt::Debug for AttachmentSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentSecret")
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_split() {
        let key = BackupKey::from_bytes([42u8; KEY_SIZE]);
        let keys = derive_session_keys(&key).unwrap();
        assert_ne!(keys.cipher_key(), keys.mac_key(), "halves must differ");

        let again = derive_session_keys(&key).unwrap();
        assert_eq!(keys.cipher_key(), again.cipher_key());
        assert_eq!(keys.mac_key(), again.mac_key());
    }

    #[test]
    fn test_session_keys_match_hkdf_expand() {
        let key = BackupKey::from_bytes([9u8; KEY_SIZE]);
        let keys = derive_session_keys(&key).unwrap();

        let mut okm = [0u8; 64];
        Hkdf::<Sha256>::new(None, &[9u8; KEY_SIZE])
            .expand(b"Backup Export", &mut okm)
            .unwrap();
        assert_eq!(keys.cipher_key()[..], okm[..32]);
        assert_eq!(keys.mac_key()[..], okm[32..]);
    }

    #[test]
    fn test_attachment_secret_generation() {
        let a = AttachmentSecret::generate();
        let b = AttachmentSecret::generate();
        assert_ne!(a.modern_key(), b.modern_key(), "random keys must differ");
        assert_ne!(a.classic_cipher_key(), a.classic_mac_key());
    }

    #[test]
    fn test_attachment_secret_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.json");
        let secret = AttachmentSecret::generate();
        secret.save(&path).unwrap();

        let loaded = AttachmentSecret::load(&path).unwrap();
        assert_eq!(secret.classic_cipher_key(), loaded.classic_cipher_key());
        assert_eq!(secret.classic_mac_key(), loaded.classic_mac_key());
        assert_eq!(secret.modern_key(), loaded.modern_key());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_attachment_secret_rejects_short_key() {
        let json = format!(
            r#"{{"classicCipherKey":"{}","classicMacKey":"{}","modernKey":"{}"}}"#,
            STANDARD.encode([1u8; 32]),
            STANDARD.encode([2u8; 32]),
            STANDARD.encode([3u8; 16]),
        );
        let err = AttachmentSecret::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("modernKey"));
    }
}
