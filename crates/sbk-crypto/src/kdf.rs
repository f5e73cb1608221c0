//! Key derivation: passphrase + salt → backup key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

/// A 256-bit backup key derived from a passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct BackupKey {
    bytes: [u8; KEY_SIZE],
}

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Passphrase-to-key derivation used by the exporter and importer.
pub trait PassphraseKdf: Send + Sync {
    fn derive(&self, passphrase: &SecretString, salt: &[u8]) -> anyhow::Result<BackupKey>;
}

/// The container's native derivation: the salt is hashed once, then the
/// space-stripped passphrase is folded into a SHA-512 chain for
/// `iterations` rounds. The first 32 bytes of the final digest are the key.
#[derive(Debug, Clone)]
pub struct IteratedSha512 {
    pub iterations: u32,
}

impl Default for IteratedSha512 {
    fn default() -> Self {
        Self {
            iterations: 250_000,
        }
    }
}

impl PassphraseKdf for IteratedSha512 {
    fn derive(&self, passphrase: &SecretString, salt: &[u8]) -> anyhow::Result<BackupKey> {
        if self.iterations == 0 {
            anyhow::bail!("iterated SHA-512 requires at least one round");
        }

        let input: Zeroizing<Vec<u8>> = Zeroizing::new(
            passphrase
                .expose_secret()
                .bytes()
                .filter(|b| *b != b' ')
                .collect(),
        );

        let mut hasher = Sha512::new();
        hasher.update(salt);

        let mut hash: Zeroizing<Vec<u8>> = input.clone();
        for _ in 0..self.iterations {
            hasher.update(hash.as_slice());
            hasher.update(input.as_slice());
            hash = Zeroizing::new(hasher.finalize_reset().to_vec());
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&hash[..KEY_SIZE]);
        Ok(BackupKey::from_bytes(key))
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Argon2idKdf {
    pub params: KdfParams,
}

impl PassphraseKdf for Argon2idKdf {
    fn derive(&self, passphrase: &SecretString, salt: &[u8]) -> anyhow::Result<BackupKey> {
        let argon2_params = Params::new(
            self.params.mem_cost_kib,
            self.params.time_cost,
            self.params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

        let mut key = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
            .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

        Ok(BackupKey::from_bytes(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_sha() -> IteratedSha512 {
        IteratedSha512 { iterations: 16 }
    }

    fn fast_argon() -> Argon2idKdf {
        Argon2idKdf {
            params: KdfParams {
                mem_cost_kib: 1024,
                time_cost: 1,
                parallelism: 1,
            },
        }
    }

    #[test]
    fn test_sha512_deterministic() {
        let passphrase = SecretString::from("1234 5678 9012");
        let salt = [7u8; 32];

        let key1 = fast_sha().derive(&passphrase, &salt).unwrap();
        let key2 = fast_sha().derive(&passphrase, &salt).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_sha512_ignores_spaces() {
        let salt = [7u8; 32];
        let spaced = fast_sha()
            .derive(&SecretString::from("12345 67890"), &salt)
            .unwrap();
        let packed = fast_sha()
            .derive(&SecretString::from("1234567890"), &salt)
            .unwrap();
        assert_eq!(spaced.as_bytes(), packed.as_bytes());
    }

    #[test]
    fn test_sha512_matches_manual_chain() {
        let salt = [3u8; 32];
        let key = IteratedSha512 { iterations: 2 }
            .derive(&SecretString::from("ab"), &salt)
            .unwrap();

        // round 1: SHA512(salt ‖ "ab" ‖ "ab"), round 2: SHA512(h1 ‖ "ab")
        let mut h = Sha512::new();
        h.update(salt);
        h.update(b"ab");
        h.update(b"ab");
        let h1 = h.finalize();
        let mut h = Sha512::new();
        h.update(h1);
        h.update(b"ab");
        let h2 = h.finalize();

        assert_eq!(key.as_bytes(), &h2[..KEY_SIZE]);
    }

    #[test]
    fn test_sha512_different_salts() {
        let passphrase = SecretString::from("same-passphrase");
        let key1 = fast_sha().derive(&passphrase, &[1u8; 32]).unwrap();
        let key2 = fast_sha().derive(&passphrase, &[2u8; 32]).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_sha512_zero_rounds_rejected() {
        let kdf = IteratedSha512 { iterations: 0 };
        assert!(kdf.derive(&SecretString::from("x"), &[0u8; 32]).is_err());
    }

    #[test]
    fn test_argon2_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; 32];

        let key1 = fast_argon().derive(&passphrase, &salt).unwrap();
        let key2 = fast_argon().derive(&passphrase, &salt).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_argon2_different_passphrases() {
        let salt = [1u8; 32];
        let key1 = fast_argon()
            .derive(&SecretString::from("passphrase-a"), &salt)
            .unwrap();
        let key2 = fast_argon()
            .derive(&SecretString::from("passphrase-b"), &salt)
            .unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = BackupKey::from_bytes([0xAA; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("170"));
    }
}
