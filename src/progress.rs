use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::BrigadeError;
use crate::store::StagingStore;

/// Per-folder Zipper progress document. Fields missing on read deserialize to
/// empty/false; unknown fields are ignored. Vectors keep insertion order so
/// the `completed_files` bound can drop the oldest entries.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct ZipProgress {
    #[serde(default)]
    pub completed_keys: Vec<String>,
    #[serde(default)]
    pub completed_files: Vec<String>,
    #[serde(default)]
    pub large_files_done: Vec<String>,
    #[serde(default)]
    pub folder_complete: bool,
}

impl ZipProgress {
    pub fn has_key(&self, key: &str) -> bool {
        self.completed_keys.iter().any(|k| k == key)
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.completed_files.iter().any(|p| p == path)
    }

    pub fn has_large_file(&self, path: &str) -> bool {
        self.large_files_done.iter().any(|p| p == path)
    }

    pub fn add_key(&mut self, key: &str) {
        if !self.has_key(key) {
            self.completed_keys.push(key.to_string());
        }
    }

    pub fn add_large_file(&mut self, path: &str) {
        if !self.has_large_file(path) {
            self.large_files_done.push(path.to_string());
        }
    }

    /// Union-merge newly archived files, then prune to the newest `max`
    /// entries. The bound is a memory/size control, not a correctness
    /// control: `completed_keys` alone suppresses duplicate uploads.
    pub fn add_files<'a>(&mut self, files: impl IntoIterator<Item = &'a str>, max: usize) {
        for f in files {
            if !self.has_file(f) {
                self.completed_files.push(f.to_string());
            }
        }
        if self.completed_files.len() > max {
            let drop = self.completed_files.len() - max;
            self.completed_files.drain(..drop);
        }
    }
}

/// Per-folder Unzipper progress document.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct UnzipProgress {
    #[serde(default)]
    pub processed_keys: Vec<String>,
    #[serde(default)]
    pub folder_complete: bool,
}

impl UnzipProgress {
    pub fn has_key(&self, key: &str) -> bool {
        self.processed_keys.iter().any(|k| k == key)
    }

    pub fn add_key(&mut self, key: &str) {
        if !self.has_key(key) {
            self.processed_keys.push(key.to_string());
        }
    }
}

/// Mapper progress document; diagnostic only, the resume gate is the
/// existence of the normal-list object.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct MapperProgress {
    #[serde(default)]
    pub mapped: bool,
}

/// One record of the per-folder large-file manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LargeFileEntry {
    pub path: String,
    pub size: u64,
    pub size_gb: f64,
}

/// Serializer side of the progress-document contract: updates to any one
/// document go through a component-wide lock held across a fresh read, the
/// in-memory mutation and the write-back. There is no compare-and-swap on
/// the staging store; the lock is the only thing serializing writers, and
/// per-folder documents keep two folders from ever contending on one key.
pub struct ProgressStore<'a> {
    store: &'a StagingStore,
    lock: Mutex<()>,
}

impl<'a> ProgressStore<'a> {
    pub fn new(store: &'a StagingStore) -> Self {
        Self { store, lock: Mutex::new(()) }
    }

    pub fn load<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, BrigadeError> {
        let _guard = self.lock.lock().expect("progress lock poisoned");
        self.load_unlocked(key)
    }

    fn load_unlocked<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, BrigadeError> {
        match self.store.get_bytes_opt(key)? {
            None => Ok(T::default()),
            Some(raw) => match serde_json::from_slice::<T>(&raw) {
                Ok(doc) => Ok(doc),
                Err(e) => {
                    // 损坏的进度文档按空处理，宁可重做也不中断 — treat a corrupt
                    // document as empty; redoing work beats aborting the run
                    tracing::warn!("进度文档解析失败 {}: {}，按空文档处理", key, e);
                    Ok(T::default())
                }
            },
        }
    }

    /// Lock → fresh read → mutate → write back. The closure sees the latest
    /// remote state, which picks up out-of-band changes between updates.
    pub fn update<T, F>(&self, key: &str, mutate: F) -> Result<T, BrigadeError>
    where
        T: DeserializeOwned + Serialize + Default + Clone,
        F: FnOnce(&mut T),
    {
        let _guard = self.lock.lock().expect("progress lock poisoned");
        let mut doc: T = self.load_unlocked(key)?;
        mutate(&mut doc);
        let raw = serde_json::to_vec(&doc).map_err(|e| {
            BrigadeError::OperationFailed(format!("进度文档序列化失败 {}: {}", key, e))
        })?;
        self.store.put_bytes(key, raw)?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_and_unknown_fields_ignored() {
        let doc: ZipProgress =
            serde_json::from_str(r#"{"completed_keys":["a.zip"],"legacy_field":1}"#).expect("parse");
        assert_eq!(doc.completed_keys, vec!["a.zip"]);
        assert!(doc.completed_files.is_empty());
        assert!(!doc.folder_complete);
    }

    #[test]
    fn add_files_dedups_and_prunes_oldest() {
        let mut doc = ZipProgress::default();
        doc.add_files(["a", "b", "c"], 5);
        doc.add_files(["b", "d"], 5);
        assert_eq!(doc.completed_files, vec!["a", "b", "c", "d"]);
        doc.add_files(["e", "f"], 4);
        // 超过上限时裁掉最旧的 — oldest entries dropped first
        assert_eq!(doc.completed_files, vec!["c", "d", "e", "f"]);
    }

    #[test]
    fn add_key_is_idempotent() {
        let mut doc = ZipProgress::default();
        doc.add_key("k1");
        doc.add_key("k1");
        assert_eq!(doc.completed_keys.len(), 1);
    }

    #[test]
    fn unzip_progress_roundtrip() {
        let mut doc = UnzipProgress::default();
        doc.add_key("pre/A_Part1.zip");
        doc.folder_complete = true;
        let raw = serde_json::to_string(&doc).expect("ser");
        let back: UnzipProgress = serde_json::from_str(&raw).expect("de");
        assert!(back.has_key("pre/A_Part1.zip"));
        assert!(back.folder_complete);
    }

    #[test]
    fn large_file_entry_json_shape() {
        let e = LargeFileEntry { path: "dir/big.iso".into(), size: 32212254720, size_gb: 30.0 };
        let raw = serde_json::to_string(&e).expect("ser");
        assert!(raw.contains("\"path\""));
        assert!(raw.contains("\"size\""));
        assert!(raw.contains("\"size_gb\""));
    }
}
