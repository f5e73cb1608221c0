//! Encrypted blob directory: attachments, stickers and avatars.
//!
//! Layout under the root:
//! ```text
//! attachments/part-<uuid>.mms      modern part, random kept in the row
//! stickers/sticker-<uuid>.blob     modern part, random kept in the row
//! avatars/<recipient id>           modern part, random inline
//! staging/avatar-<uuid>            avatar waiting to replace its slot
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sbk_core::{BackupError, BackupResult};
use sbk_crypto::at_rest::{self, MODERN_RANDOM_LEN};
use sbk_crypto::{AttachmentSecret, CtrWriter};

/// An avatar written outside its slot, moved in by [`BlobStore::promote_avatar`].
pub struct StagedAvatar {
    pub recipient_id: String,
    pub path: PathBuf,
    pub writer: CtrWriter<File>,
}

/// A freshly allocated blob file. The random belongs in the owning row.
pub struct NewBlob {
    pub path: PathBuf,
    pub random: [u8; MODERN_RANDOM_LEN],
    pub writer: CtrWriter<File>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarEntry {
    pub recipient_id: String,
    pub path: PathBuf,
    /// Plaintext length
    pub length: u64,
}

pub struct BlobStore {
    root: PathBuf,
    secret: AttachmentSecret,
}

impl BlobStore {
    /// Open a blob directory, creating its subdirectories.
    pub fn open(root: &Path, secret: AttachmentSecret) -> BackupResult<Self> {
        let store = Self {
            root: root.to_path_buf(),
            secret,
        };
        for dir in [
            store.attachments_dir(),
            store.stickers_dir(),
            store.avatars_dir(),
            store.staging_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(store)
    }

    pub fn secret(&self) -> &AttachmentSecret {
        &self.secret
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.root.join("attachments")
    }

    pub fn stickers_dir(&self) -> PathBuf {
        self.root.join("stickers")
    }

    pub fn avatars_dir(&self) -> PathBuf {
        self.root.join("avatars")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn create_attachment(&self) -> BackupResult<NewBlob> {
        let path = self
            .attachments_dir()
            .join(format!("part-{}.mms", uuid::Uuid::new_v4()));
        self.create_part(path)
    }

    pub fn create_sticker(&self) -> BackupResult<NewBlob> {
        let path = self
            .stickers_dir()
            .join(format!("sticker-{}.blob", uuid::Uuid::new_v4()));
        self.create_part(path)
    }

    fn create_part(&self, path: PathBuf) -> BackupResult<NewBlob> {
        let (writer, random) = at_rest::create_modern(&self.secret, &path)?;
        Ok(NewBlob {
            path,
            random,
            writer,
        })
    }

    /// Open a part referenced by a row, choosing the format from its random.
    pub fn open_part(&self, path: &Path, random: Option<&[u8]>) -> BackupResult<Box<dyn Read + Send>> {
        at_rest::decryptor_for(&self.secret, random)?.open(path)
    }

    /// Remove a blob file; a file that is already gone is not an error.
    pub fn delete(&self, path: &Path) -> BackupResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Slot path for a recipient's avatar. Ids that could leave the directory are rejected.
    pub fn avatar_path(&self, recipient_id: &str) -> BackupResult<PathBuf> {
        let valid = !recipient_id.is_empty()
            && recipient_id != "."
            && recipient_id != ".."
            && !recipient_id.contains(['/', '\\']);
        if !valid {
            return Err(BackupError::Malformed(format!(
                "invalid avatar recipient id {recipient_id:?}"
            )));
        }
        Ok(self.avatars_dir().join(recipient_id))
    }

    /// Writer for a recipient's avatar slot, replacing any previous avatar.
    pub fn avatar_writer(&self, recipient_id: &str) -> BackupResult<CtrWriter<File>> {
        let path = self.avatar_path(recipient_id)?;
        at_rest::create_inline(&self.secret, &path)
    }

    /// Write a recipient's avatar to a staging file, leaving the current slot
    /// untouched until [`promote_avatar`](Self::promote_avatar).
    pub fn stage_avatar(&self, recipient_id: &str) -> BackupResult<StagedAvatar> {
        self.avatar_path(recipient_id)?;
        let path = self
            .staging_dir()
            .join(format!("avatar-{}", uuid::Uuid::new_v4()));
        let writer = at_rest::create_inline(&self.secret, &path)?;
        Ok(StagedAvatar {
            recipient_id: recipient_id.to_string(),
            path,
            writer,
        })
    }

    /// Move a staged avatar over its recipient's slot.
    pub fn promote_avatar(&self, staged: &Path, recipient_id: &str) -> BackupResult<()> {
        let slot = self.avatar_path(recipient_id)?;
        std::fs::rename(staged, &slot)?;
        Ok(())
    }

    pub fn open_avatar(&self, recipient_id: &str) -> BackupResult<Box<dyn Read + Send>> {
        let path = self.avatar_path(recipient_id)?;
        at_rest::open_inline(&self.secret, &path)
    }

    /// Every stored avatar, sorted by recipient id.
    pub fn avatars(&self) -> BackupResult<Vec<AvatarEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(self.avatars_dir())? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(recipient_id) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "skipping avatar with non UTF-8 name");
                continue;
            };
            let Some(length) = meta.len().checked_sub(MODERN_RANDOM_LEN as u64) else {
                tracing::warn!(%recipient_id, "skipping truncated avatar file");
                continue;
            };
            entries.push(AvatarEntry {
                recipient_id,
                path: entry.path(),
                length,
            });
        }
        entries.sort_by(|a, b| a.recipient_id.cmp(&b.recipient_id));
        Ok(entries)
    }
}
