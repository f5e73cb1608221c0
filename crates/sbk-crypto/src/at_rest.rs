//! At-rest encryption of attachment, sticker and avatar files.
//!
//! Two on-disk formats exist:
//!
//! - **modern**: plain AES-256-CTR (zero IV) under
//!   `HMAC-SHA256(modern_key, random)`, where the 32-byte random lives in the
//!   owning database row, or inline as the first 32 bytes of the file for
//!   avatars;
//! - **classic**: `[16-byte IV][AES-256-CTR ciphertext][32-byte
//!   HMAC-SHA256(mac_key, IV ‖ ciphertext)]` under fixed secret keys.
//!
//! A row's stored random selects the format once: exactly 32 bytes means
//! modern, anything else means classic.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use rand::RngCore;
use sbk_core::{BackupError, BackupResult};
use zeroize::Zeroize;

use crate::keys::AttachmentSecret;
use crate::{Aes256Ctr, HmacSha256, BUFFER_SIZE, IV_SIZE, KEY_SIZE};

/// Length of the per-file random used by the modern format
pub const MODERN_RANDOM_LEN: usize = 32;

/// Length of the untruncated HMAC trailer of the classic format
pub const CLASSIC_MAC_LEN: usize = 32;

/// Opens an encrypted part file as a plaintext stream.
pub trait PartDecryptor: Send + Sync {
    fn open(&self, path: &Path) -> BackupResult<Box<dyn Read + Send>>;
}

/// Pick the decryptor for a row given its stored random.
pub fn decryptor_for(
    secret: &AttachmentSecret,
    random: Option<&[u8]>,
) -> BackupResult<Box<dyn PartDecryptor>> {
    match random {
        Some(random) if random.len() == MODERN_RANDOM_LEN => {
            Ok(Box::new(ModernPartDecryptor::new(secret, random)?))
        }
        _ => Ok(Box::new(ClassicPartDecryptor::new(secret))),
    }
}

fn modern_file_key(secret: &AttachmentSecret, random: &[u8]) -> BackupResult<[u8; KEY_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(secret.modern_key())
        .map_err(|e| BackupError::Crypto(format!("HMAC key: {e}")))?;
    mac.update(random);
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

fn ctr(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Aes256Ctr {
    Aes256Ctr::new(key.into(), iv.into())
}

pub struct ModernPartDecryptor {
    key: [u8; KEY_SIZE],
}

impl ModernPartDecryptor {
    pub fn new(secret: &AttachmentSecret, random: &[u8]) -> BackupResult<Self> {
        Ok(Self {
            key: modern_file_key(secret, random)?,
        })
    }
}

impl PartDecryptor for ModernPartDecryptor {
    fn open(&self, path: &Path) -> BackupResult<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        Ok(Box::new(CtrReader::new(file, ctr(&self.key, &[0u8; IV_SIZE]))))
    }
}

impl Drop for ModernPartDecryptor {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

pub struct ClassicPartDecryptor {
    cipher_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl ClassicPartDecryptor {
    pub fn new(secret: &AttachmentSecret) -> Self {
        Self {
            cipher_key: *secret.classic_cipher_key(),
            mac_key: *secret.classic_mac_key(),
        }
    }

    fn mac(&self) -> BackupResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| BackupError::Crypto(format!("HMAC key: {e}")))
    }

    /// Check the trailing HMAC over `IV ‖ ciphertext` before any plaintext
    /// is released.
    fn verify(&self, file: &mut File, ciphertext_len: u64) -> BackupResult<()> {
        let mut mac = self.mac()?;
        let mut body = (&mut *file).take(IV_SIZE as u64 + ciphertext_len);
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            mac.update(&buf[..n]);
        }
        let mut tag = [0u8; CLASSIC_MAC_LEN];
        file.read_exact(&mut tag)?;
        mac.verify_slice(&tag)
            .map_err(|_| BackupError::Crypto("classic part MAC mismatch".into()))
    }
}

impl PartDecryptor for ClassicPartDecryptor {
    fn open(&self, path: &Path) -> BackupResult<Box<dyn Read + Send>> {
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        let overhead = (IV_SIZE + CLASSIC_MAC_LEN) as u64;
        if total < overhead {
            return Err(BackupError::Malformed(format!(
                "classic part {} is only {total} bytes",
                path.display()
            )));
        }
        let ciphertext_len = total - overhead;
        self.verify(&mut file, ciphertext_len)?;

        file.seek(SeekFrom::Start(0))?;
        let mut iv = [0u8; IV_SIZE];
        file.read_exact(&mut iv)?;
        let cipher = ctr(&self.cipher_key, &iv);
        Ok(Box::new(CtrReader::new(file.take(ciphertext_len), cipher)))
    }
}

impl Drop for ClassicPartDecryptor {
    fn drop(&mut self) {
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
    }
}

/// Create a modern part file. Returns the writer and the random to store in
/// the owning row.
pub fn create_modern(
    secret: &AttachmentSecret,
    path: &Path,
) -> BackupResult<(CtrWriter<File>, [u8; MODERN_RANDOM_LEN])> {
    let mut random = [0u8; MODERN_RANDOM_LEN];
    rand::thread_rng().fill_bytes(&mut random);
    let mut key = modern_file_key(secret, &random)?;
    let cipher = ctr(&key, &[0u8; IV_SIZE]);
    key.zeroize();
    Ok((CtrWriter::new(File::create(path)?, cipher), random))
}

/// Create a modern file whose random is stored inline (avatars).
pub fn create_inline(secret: &AttachmentSecret, path: &Path) -> BackupResult<CtrWriter<File>> {
    let mut random = [0u8; MODERN_RANDOM_LEN];
    rand::thread_rng().fill_bytes(&mut random);
    let mut file = File::create(path)?;
    file.write_all(&random)?;
    let mut key = modern_file_key(secret, &random)?;
    let cipher = ctr(&key, &[0u8; IV_SIZE]);
    key.zeroize();
    Ok(CtrWriter::new(file, cipher))
}

/// Open a modern file whose random is stored inline (avatars).
pub fn open_inline(secret: &AttachmentSecret, path: &Path) -> BackupResult<Box<dyn Read + Send>> {
    let mut file = File::open(path)?;
    let mut random = [0u8; MODERN_RANDOM_LEN];
    file.read_exact(&mut random)?;
    let mut key = modern_file_key(secret, &random)?;
    let cipher = ctr(&key, &[0u8; IV_SIZE]);
    key.zeroize();
    Ok(Box::new(CtrReader::new(file, cipher)))
}

/// Encrypt a buffer in the classic part format. New files are always written
/// in the modern format; this exists for stores still holding classic parts.
pub fn seal_classic(secret: &AttachmentSecret, plaintext: &[u8]) -> BackupResult<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(IV_SIZE + plaintext.len() + CLASSIC_MAC_LEN);
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    ctr(secret.classic_cipher_key(), &iv).apply_keystream(&mut out[IV_SIZE..]);

    let mut mac = HmacSha256::new_from_slice(secret.classic_mac_key())
        .map_err(|e| BackupError::Crypto(format!("HMAC key: {e}")))?;
    mac.update(&out);
    out.extend_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// A reader that applies an AES-CTR keystream to everything read through it.
pub struct CtrReader<R> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> CtrReader<R> {
    fn new(inner: R, cipher: Aes256Ctr) -> Self {
        Self { inner, cipher }
    }
}

impl<R: Read> Read for CtrReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// A writer that encrypts with an AES-CTR keystream before passing bytes on.
pub struct CtrWriter<W: Write> {
    inner: W,
    cipher: Aes256Ctr,
    buf: Vec<u8>,
    written: u64,
}

impl<W: Write> CtrWriter<W> {
    fn new(inner: W, cipher: Aes256Ctr) -> Self {
        Self {
            inner,
            cipher,
            buf: Vec::with_capacity(BUFFER_SIZE),
            written: 0,
        }
    }

    /// Plaintext bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for CtrWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.cipher.apply_keystream(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
