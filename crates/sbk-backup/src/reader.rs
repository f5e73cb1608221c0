//! Frame reader: the import half of the codec.

use std::io::{Read, Write};

use prost::Message;
use sbk_core::{BackupError, BackupResult};
use sbk_crypto::{
    derive_session_keys, BackupKey, CipherSession, PassphraseKdf, BUFFER_SIZE, TRUNCATED_MAC_LEN,
};
use secrecy::SecretString;
use tracing::debug;

use crate::frame::BackupFrame;
use crate::proto;

/// Default bound on a single encrypted frame (128 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 128 * 1024 * 1024;

/// The cleartext header carries only an IV and a salt.
const MAX_HEADER_LENGTH: u32 = 4096;

pub struct FrameReader<R: Read> {
    input: R,
    session: CipherSession,
    max_frame_length: u32,
}

impl<R: Read> FrameReader<R> {
    /// Read the header and re-derive the session keys from its salt.
    pub fn open(
        mut input: R,
        passphrase: &SecretString,
        kdf: &dyn PassphraseKdf,
    ) -> BackupResult<Self> {
        let (iv, salt) = read_header(&mut input)?;
        let key = kdf.derive(passphrase, &salt)?;
        Self::start(input, &key, iv)
    }

    /// Open a stream with an already derived backup key.
    pub fn open_with_key(mut input: R, key: &BackupKey) -> BackupResult<Self> {
        let (iv, _salt) = read_header(&mut input)?;
        Self::start(input, key, iv)
    }

    fn start(input: R, key: &BackupKey, iv: [u8; 16]) -> BackupResult<Self> {
        let keys = derive_session_keys(key)?;
        Ok(Self {
            input,
            session: CipherSession::new(keys, iv),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        })
    }

    pub fn with_max_frame_length(mut self, max: u32) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn counter(&self) -> u32 {
        self.session.counter()
    }

    /// Read, authenticate and decode the next frame. Frames carrying nothing
    /// this reader understands are skipped.
    pub fn read_frame(&mut self) -> BackupResult<BackupFrame> {
        loop {
            let len = read_u32(&mut self.input)?;
            if len < TRUNCATED_MAC_LEN as u32 || len > self.max_frame_length {
                return Err(BackupError::Malformed(format!(
                    "frame length {len} out of range"
                )));
            }

            let mut body = vec![0u8; len as usize];
            self.input.read_exact(&mut body)?;
            let plaintext = self.session.open_frame(&body)?;
            let raw = proto::BackupFrame::decode(plaintext.as_slice())?;

            match BackupFrame::from_proto(raw)? {
                Some(BackupFrame::Header { .. }) => {
                    return Err(BackupError::Malformed(
                        "header frame inside the encrypted stream".into(),
                    ))
                }
                Some(frame) => return Ok(frame),
                None => debug!(counter = self.session.counter(), "skipping unrecognised frame"),
            }
        }
    }

    /// Decrypt the payload announced by the previous frame into `out`.
    ///
    /// All `length` bytes and the tag are consumed before the tag is checked,
    /// so a `PayloadAuthentication` error leaves the stream positioned at the
    /// next frame.
    pub fn read_payload_to<W: Write + ?Sized>(
        &mut self,
        length: u32,
        out: &mut W,
    ) -> BackupResult<()> {
        let mut opener = self.session.payload_opener()?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut remaining = length as usize;

        while remaining > 0 {
            let n = remaining.min(buf.len());
            self.input.read_exact(&mut buf[..n])?;
            opener.update(&mut buf[..n]);
            out.write_all(&buf[..n])?;
            remaining -= n;
        }

        let mut tag = [0u8; TRUNCATED_MAC_LEN];
        self.input.read_exact(&mut tag)?;
        opener.verify(&tag)
    }

    /// Consume a payload without keeping it.
    pub fn skip_payload(&mut self, length: u32) -> BackupResult<()> {
        self.read_payload_to(length, &mut std::io::sink())
    }
}

fn read_u32<R: Read>(input: &mut R) -> BackupResult<u32> {
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    Ok(u32::from_be_bytes(len))
}

fn read_header<R: Read>(input: &mut R) -> BackupResult<([u8; 16], Vec<u8>)> {
    let len = read_u32(input)?;
    if len == 0 || len > MAX_HEADER_LENGTH {
        return Err(BackupError::Malformed(format!(
            "header length {len} out of range"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    input.read_exact(&mut bytes)?;

    let raw = proto::BackupFrame::decode(bytes.as_slice())?;
    if raw.header.is_none() {
        return Err(BackupError::Malformed(
            "backup stream does not start with a header".into(),
        ));
    }
    match BackupFrame::from_proto(raw)? {
        Some(BackupFrame::Header { iv, salt }) => Ok((iv, salt)),
        _ => Err(BackupError::Malformed(
            "backup stream does not start with a header".into(),
        )),
    }
}
