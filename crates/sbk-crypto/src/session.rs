//! Counter-IV cipher session shared by the frame writer and reader.
//!
//! Every frame and every streamed payload consumes exactly one counter value:
//! the current counter is written big-endian into `iv[0..4]` and then
//! advanced. The remaining 12 IV bytes stay fixed for the session.
//!
//! Frame body on the wire: `[AES-256-CTR ciphertext][HMAC(ciphertext)[..10]]`.
//! Streamed payload: `[ciphertext][HMAC(iv ‖ ciphertext)[..10]]`.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use sbk_core::{BackupError, BackupResult};

use crate::keys::SessionKeys;
use crate::{Aes256Ctr, HmacSha256, IV_SIZE, TRUNCATED_MAC_LEN};

pub struct CipherSession {
    keys: SessionKeys,
    iv: [u8; IV_SIZE],
    counter: u32,
}

impl CipherSession {
    /// Start a session from the header IV. The counter starts at the IV's
    /// first four bytes read as a big-endian integer.
    pub fn new(keys: SessionKeys, iv: [u8; IV_SIZE]) -> Self {
        let counter = u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]]);
        Self { keys, iv, counter }
    }

    /// The counter value the next frame or payload will use.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    fn next_iv(&mut self) -> [u8; IV_SIZE] {
        self.iv[..4].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        self.iv
    }

    fn cipher(&self, iv: &[u8; IV_SIZE]) -> Aes256Ctr {
        Aes256Ctr::new(self.keys.cipher_key().into(), iv.into())
    }

    fn mac(&self) -> BackupResult<HmacSha256> {
        HmacSha256::new_from_slice(self.keys.mac_key())
            .map_err(|e| BackupError::Crypto(format!("HMAC key: {e}")))
    }

    /// Encrypt one serialized frame, returning `ciphertext ‖ truncated MAC`.
    pub fn seal_frame(&mut self, plaintext: &[u8]) -> BackupResult<Vec<u8>> {
        let iv = self.next_iv();
        let mut body = Vec::with_capacity(plaintext.len() + TRUNCATED_MAC_LEN);
        body.extend_from_slice(plaintext);
        self.cipher(&iv).apply_keystream(&mut body);

        let mut mac = self.mac()?;
        mac.update(&body);
        let tag = mac.finalize().into_bytes();
        body.extend_from_slice(&tag[..TRUNCATED_MAC_LEN]);
        Ok(body)
    }

    /// Authenticate and decrypt one frame body produced by [`seal_frame`].
    ///
    /// The counter advances even when authentication fails; the caller is
    /// expected to abort the stream.
    ///
    /// [`seal_frame`]: CipherSession::seal_frame
    pub fn open_frame(&mut self, body: &[u8]) -> BackupResult<Vec<u8>> {
        if body.len() < TRUNCATED_MAC_LEN {
            return Err(BackupError::Malformed(format!(
                "frame body of {} bytes is shorter than its MAC",
                body.len()
            )));
        }
        let iv = self.next_iv();
        let (ciphertext, tag) = body.split_at(body.len() - TRUNCATED_MAC_LEN);

        let mut mac = self.mac()?;
        mac.update(ciphertext);
        mac.verify_truncated_left(tag)
            .map_err(|_| BackupError::FrameAuthentication)?;

        let mut plaintext = ciphertext.to_vec();
        self.cipher(&iv).apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    /// Begin encrypting a streamed payload. Consumes one counter value.
    pub fn payload_sealer(&mut self) -> BackupResult<PayloadSealer> {
        let iv = self.next_iv();
        let mut mac = self.mac()?;
        mac.update(&iv);
        Ok(PayloadSealer {
            cipher: self.cipher(&iv),
            mac,
        })
    }

    /// Begin decrypting a streamed payload. Consumes one counter value.
    pub fn payload_opener(&mut self) -> BackupResult<PayloadOpener> {
        let iv = self.next_iv();
        let mut mac = self.mac()?;
        mac.update(&iv);
        Ok(PayloadOpener {
            cipher: self.cipher(&iv),
            mac,
        })
    }
}

impl std::fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSession")
            .field("keys", &self.keys)
            .field("counter", &self.counter)
            .finish()
    }
}

/// Incremental payload encryption: chunks are encrypted in place and folded
/// into the running MAC.
pub struct PayloadSealer {
    cipher: Aes256Ctr,
    mac: HmacSha256,
}

impl PayloadSealer {
    pub fn update(&mut self, chunk: &mut [u8]) {
        self.cipher.apply_keystream(chunk);
        self.mac.update(chunk);
    }

    pub fn finalize(self) -> [u8; TRUNCATED_MAC_LEN] {
        let full = self.mac.finalize().into_bytes();
        let mut tag = [0u8; TRUNCATED_MAC_LEN];
        tag.copy_from_slice(&full[..TRUNCATED_MAC_LEN]);
        tag
    }
}

/// Incremental payload decryption, the mirror of [`PayloadSealer`].
pub struct PayloadOpener {
    cipher: Aes256Ctr,
    mac: HmacSha256,
}

impl PayloadOpener {
    pub fn update(&mut self, chunk: &mut [u8]) {
        self.mac.update(chunk);
        self.cipher.apply_keystream(chunk);
    }

    /// Check the trailing tag once every ciphertext byte has been consumed.
    pub fn verify(self, tag: &[u8]) -> BackupResult<()> {
        if tag.len() != TRUNCATED_MAC_LEN {
            return Err(BackupError::Malformed(format!(
                "payload MAC is {} bytes",
                tag.len()
            )));
        }
        self.mac
            .verify_truncated_left(tag)
            .map_err(|_| BackupError::PayloadAuthentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys() -> SessionKeys {
        SessionKeys::from_parts([1u8; 32], [2u8; 32])
    }

    fn iv() -> [u8; IV_SIZE] {
        let mut iv = [0x5Au8; IV_SIZE];
        iv[..4].copy_from_slice(&41u32.to_be_bytes());
        iv
    }

    #[test]
    fn test_counter_starts_from_iv_prefix() {
        let session = CipherSession::new(keys(), iv());
        assert_eq!(session.counter(), 41);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut writer = CipherSession::new(keys(), iv());
        let mut reader = CipherSession::new(keys(), iv());

        for msg in [&b"first"[..], b"", b"third frame with more bytes"] {
            let body = writer.seal_frame(msg).unwrap();
            assert_eq!(body.len(), msg.len() + TRUNCATED_MAC_LEN);
            assert_eq!(reader.open_frame(&body).unwrap(), msg);
        }
        assert_eq!(writer.counter(), 44);
        assert_eq!(reader.counter(), 44);
    }

    #[test]
    fn test_counter_shared_by_frames_and_payloads() {
        let mut s = CipherSession::new(keys(), iv());
        s.seal_frame(b"a").unwrap();
        let sealer = s.payload_sealer().unwrap();
        drop(sealer);
        s.seal_frame(b"b").unwrap();
        assert_eq!(s.counter(), 44);
    }

    #[test]
    fn test_counter_wraps() {
        let mut iv = iv();
        iv[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut s = CipherSession::new(keys(), iv);
        s.seal_frame(b"x").unwrap();
        assert_eq!(s.counter(), 0);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let mut s = CipherSession::new(keys(), iv());
        let a = s.seal_frame(b"identical").unwrap();
        let b = s.seal_frame(b"identical").unwrap();
        assert_ne!(a, b, "consecutive frames must not reuse an IV");
    }

    #[test]
    fn test_tampered_frame_fails() {
        let mut writer = CipherSession::new(keys(), iv());
        let body = writer.seal_frame(b"authenticated").unwrap();

        for i in 0..body.len() {
            let mut tampered = body.clone();
            tampered[i] ^= 0x01;
            let mut reader = CipherSession::new(keys(), iv());
            let err = reader.open_frame(&tampered).unwrap_err();
            assert!(matches!(err, BackupError::FrameAuthentication), "byte {i}");
        }
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let mut reader = CipherSession::new(keys(), iv());
        let err = reader.open_frame(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, BackupError::Malformed(_)));
    }

    #[test]
    fn test_payload_bad_tag() {
        let mut writer = CipherSession::new(keys(), iv());
        let mut reader = CipherSession::new(keys(), iv());

        let mut data = b"payload bytes".to_vec();
        let mut sealer = writer.payload_sealer().unwrap();
        sealer.update(&mut data);
        let mut tag = sealer.finalize();
        tag[0] ^= 0xFF;

        let mut opener = reader.payload_opener().unwrap();
        opener.update(&mut data);
        let err = opener.verify(&tag).unwrap_err();
        assert!(err.is_recoverable());
    }

    proptest! {
        #[test]
        fn test_prop_payload_roundtrip_any_chunking(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            split in 0usize..4096,
        ) {
            let split = split.min(data.len());
            let mut writer = CipherSession::new(keys(), iv());
            let mut reader = CipherSession::new(keys(), iv());

            let mut ct = data.clone();
            let mut sealer = writer.payload_sealer().unwrap();
            let (a, b) = ct.split_at_mut(split);
            sealer.update(a);
            sealer.update(b);
            let tag = sealer.finalize();

            // decrypt in a single pass: chunk boundaries must not matter
            let mut pt = ct.clone();
            let mut opener = reader.payload_opener().unwrap();
            opener.update(&mut pt);
            prop_assert!(opener.verify(&tag).is_ok());
            prop_assert_eq!(pt, data);
        }
    }
}
