//! Learned fixes, persisted across runs
//!
//! Maps raw error text to the payload that fixed it. Lookup is substring
//! containment of a stored key inside the new error text, first match in
//! insertion order, so one entry covers slightly different instances of the
//! same error. Keys are never normalized: two wordings of one error are two
//! entries.
//!
//! The backing file is a JSON object whose key order is the insertion order.
//! It is rewritten in full on every `store`, under an exclusive lock.

use crate::error::{FixError, FixResult};
use chrono::Utc;
use fs2::FileExt;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// One learned error → payload pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningEntry {
    pub error: String,
    pub payload: String,
}

/// Entries in file order. (De)serializes as a JSON object.
#[derive(Debug, Default)]
struct OrderedEntries(Vec<LearningEntry>);

impl Serialize for OrderedEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in &self.0 {
            map.serialize_entry(&entry.error, &entry.payload)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping error text to fix payload text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = OrderedEntries::default();
                while let Some((error, payload)) = access.next_entry::<String, String>()? {
                    upsert(&mut entries.0, error, payload);
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Replace the payload of an existing exact key in place, or append.
fn upsert(entries: &mut Vec<LearningEntry>, error: String, payload: String) {
    match entries.iter_mut().find(|e| e.error == error) {
        Some(existing) => existing.payload = payload,
        None => entries.push(LearningEntry { error, payload }),
    }
}

/// The learning store and its backing file
#[derive(Debug)]
pub struct LearningStore {
    path: PathBuf,
    entries: Vec<LearningEntry>,
}

impl LearningStore {
    /// An empty store that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// Load from disk. A missing file is an empty store. A corrupt file is
    /// moved aside and the store starts empty.
    pub fn load(path: impl Into<PathBuf>) -> FixResult<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "no learning store yet");
            return Ok(Self::empty(path));
        }

        let content = {
            let _lock = StoreLock::acquire(&path, false)?;
            fs::read_to_string(&path).map_err(|e| FixError::io(&path, e))?
        };

        match serde_json::from_str::<OrderedEntries>(&content) {
            Ok(OrderedEntries(entries)) => {
                info!(path = %path.display(), entries = entries.len(), "learning store loaded");
                Ok(Self { path, entries })
            }
            Err(err) => {
                let moved_to = preserve_corrupt_store(&path, &content);
                warn!(
                    path = %path.display(),
                    preserved = %moved_to.display(),
                    error = %err,
                    "learning store was corrupted; starting empty"
                );
                Ok(Self::empty(path))
            }
        }
    }

    /// First stored key (in insertion order) contained in `error`.
    pub fn lookup(&self, error: &str) -> Option<&LearningEntry> {
        self.entries
            .iter()
            .find(|entry| !entry.error.is_empty() && error.contains(entry.error.as_str()))
    }

    /// Record `error → payload` and persist immediately.
    pub fn store(&mut self, error: impl Into<String>, payload: impl Into<String>) -> FixResult<()> {
        upsert(&mut self.entries, error.into(), payload.into());
        self.save()
    }

    /// Rewrite the backing file with the full mapping.
    pub fn save(&self) -> FixResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| FixError::io(parent, e))?;
        }

        let content = serde_json::to_string_pretty(&OrderedEntries(self.entries.clone()))
            .map_err(|e| FixError::Store(format!("failed to serialize: {}", e)))?;

        let _lock = StoreLock::acquire(&self.path, true)?;
        write_atomic(&self.path, &content)?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "learning store saved");
        Ok(())
    }

    pub fn entries(&self) -> &[LearningEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Advisory lock on `<store>.lock`, released on drop
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StoreLock {
    fn acquire(store_path: &Path, exclusive: bool) -> FixResult<Self> {
        let lock_path = sibling(store_path, "lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| FixError::io(&lock_path, e))?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.kind() != ErrorKind::WouldBlock => {
                    return Err(FixError::io(&lock_path, err));
                }
                Err(_) => {
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(FixError::Store(format!(
                            "timed out waiting for lock on {} ({}s)",
                            store_path.display(),
                            LOCK_TIMEOUT_SECS
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }
    }
}

/// `learned.json` + "tmp" -> `learned.json.tmp`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn write_atomic(path: &Path, content: &str) -> FixResult<()> {
    let tmp_path = sibling(path, "tmp");
    fs::write(&tmp_path, content).map_err(|e| FixError::io(&tmp_path, e))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(FixError::io(path, err));
    }
    Ok(())
}

fn preserve_corrupt_store(path: &Path, content: &str) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let corrupt_path = sibling(path, &format!("corrupt-{}", stamp));
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
    corrupt_path
}
