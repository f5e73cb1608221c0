//! Legacy flat preferences: named files of string/bool/string-set values.
//!
//! All files live in one JSON document (`{file: {key: value}}`), loaded fully
//! into memory and flushed atomically via temp+rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sbk_core::{BackupResult, PreferenceValue};

pub trait PreferenceStore {
    fn get(&self, file: &str, key: &str) -> Option<&PreferenceValue>;

    fn put(&mut self, file: &str, key: &str, value: PreferenceValue);

    fn remove(&mut self, file: &str, key: &str);

    /// Persist pending changes.
    fn flush(&mut self) -> BackupResult<()>;

    /// Drop pending changes, reverting to the last flushed state.
    fn discard(&mut self) -> BackupResult<()>;
}

type PreferenceFiles = BTreeMap<String, BTreeMap<String, PreferenceValue>>;

pub struct JsonPreferenceStore {
    path: PathBuf,
    files: PreferenceFiles,
    dirty: bool,
}

impl JsonPreferenceStore {
    /// Load or create the store. A missing file starts empty.
    pub fn open(path: &Path) -> BackupResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            files: load(path)?,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.files.values().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load(path: &Path) -> BackupResult<PreferenceFiles> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading preferences: {}", path.display()))?;
    let files = serde_json::from_str(&content)
        .with_context(|| format!("parsing preferences: {}", path.display()))?;
    Ok(files)
}

impl PreferenceStore for JsonPreferenceStore {
    fn get(&self, file: &str, key: &str) -> Option<&PreferenceValue> {
        self.files.get(file).and_then(|f| f.get(key))
    }

    fn put(&mut self, file: &str, key: &str, value: PreferenceValue) {
        self.files
            .entry(file.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.dirty = true;
    }

    fn remove(&mut self, file: &str, key: &str) {
        if let Some(f) = self.files.get_mut(file) {
            if f.remove(key).is_some() {
                self.dirty = true;
            }
        }
    }

    fn flush(&mut self) -> BackupResult<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating preferences dir: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.files).context("serializing preferences")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing preferences temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming preferences: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }

    fn discard(&mut self) -> BackupResult<()> {
        self.files = load(&self.path)?;
        self.dirty = false;
        Ok(())
    }
}
