//! Frame writer: the export half of the codec.

use std::io::{ErrorKind, Read, Write};

use prost::Message;
use rand::RngCore;
use sbk_core::{BackupError, BackupResult};
use sbk_crypto::{
    derive_session_keys, BackupKey, CipherSession, PassphraseKdf, BUFFER_SIZE, IV_SIZE, SALT_SIZE,
};
use secrecy::SecretString;

use crate::frame::BackupFrame;

pub struct FrameWriter<W: Write> {
    out: W,
    session: CipherSession,
}

impl<W: Write> FrameWriter<W> {
    /// Generate fresh salt and IV, derive the session keys and write the
    /// cleartext header.
    pub fn new(out: W, passphrase: &SecretString, kdf: &dyn PassphraseKdf) -> BackupResult<Self> {
        let mut salt = [0u8; SALT_SIZE];
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let key = kdf.derive(passphrase, &salt)?;
        Self::with_key(out, &key, &salt, iv)
    }

    /// Start a stream from an already derived backup key.
    pub fn with_key(
        mut out: W,
        key: &BackupKey,
        salt: &[u8],
        iv: [u8; IV_SIZE],
    ) -> BackupResult<Self> {
        let keys = derive_session_keys(key)?;
        let header = BackupFrame::Header {
            iv,
            salt: salt.to_vec(),
        }
        .to_proto()
        .encode_to_vec();

        out.write_all(&frame_length(header.len())?.to_be_bytes())?;
        out.write_all(&header)?;

        Ok(Self {
            out,
            session: CipherSession::new(keys, iv),
        })
    }

    /// Counter value the next frame or payload will consume.
    pub fn counter(&self) -> u32 {
        self.session.counter()
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn write_frame(&mut self, frame: &BackupFrame) -> BackupResult<()> {
        if let BackupFrame::Header { .. } = frame {
            return Err(BackupError::Malformed(
                "header is written once, when the stream is opened".into(),
            ));
        }
        let plaintext = frame.to_proto().encode_to_vec();
        let body = self.session.seal_frame(&plaintext)?;
        self.out.write_all(&frame_length(body.len())?.to_be_bytes())?;
        self.out.write_all(&body)?;
        Ok(())
    }

    pub fn write_attachment<R: Read>(
        &mut self,
        row_id: i64,
        unique_id: i64,
        source: R,
        size: u64,
    ) -> BackupResult<()> {
        let length = payload_length(size)?;
        self.write_frame(&BackupFrame::Attachment {
            row_id,
            unique_id,
            length,
        })?;
        self.write_payload(source, size)
    }

    pub fn write_sticker<R: Read>(&mut self, row_id: i64, source: R, size: u64) -> BackupResult<()> {
        let length = payload_length(size)?;
        self.write_frame(&BackupFrame::Sticker { row_id, length })?;
        self.write_payload(source, size)
    }

    pub fn write_avatar<R: Read>(
        &mut self,
        recipient_id: &str,
        source: R,
        size: u64,
    ) -> BackupResult<()> {
        let length = payload_length(size)?;
        self.write_frame(&BackupFrame::Avatar {
            name: None,
            recipient_id: Some(recipient_id.to_string()),
            length,
        })?;
        self.write_payload(source, size)
    }

    /// Stream the payload announced by the frame just written, then check it
    /// against the length that frame declared.
    pub fn write_payload<R: Read>(&mut self, mut source: R, declared: u64) -> BackupResult<()> {
        let mut sealer = self.session.payload_sealer()?;
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut total: u64 = 0;

        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            sealer.update(&mut buf[..n]);
            self.out.write_all(&buf[..n])?;
            total += n as u64;
        }

        self.out.write_all(&sealer.finalize())?;

        if total != declared {
            return Err(BackupError::SizeMismatch {
                expected: declared,
                actual: total,
            });
        }
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> BackupResult<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Payload lengths travel as a non-negative 32-bit signed value.
fn payload_length(size: u64) -> BackupResult<u32> {
    i32::try_from(size)
        .map(|v| v as u32)
        .map_err(|_| BackupError::LengthOverflow(size))
}

fn frame_length(len: usize) -> BackupResult<u32> {
    i32::try_from(len)
        .map(|v| v as u32)
        .map_err(|_| BackupError::LengthOverflow(len as u64))
}
