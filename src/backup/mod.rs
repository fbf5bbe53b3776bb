//! Expiring local backups of open documents.
//!
//! A [`BackupStore`] keeps one [`BackupRecord`] per document name in a
//! [`BackupBackend`]. Writes never fail to the caller: a full backend gets one
//! cleanup-and-retry, after which the snapshot is dropped and logged. Reads
//! discard records that are unreadable or older than the expiry window.
//!
//! [`Autosave`] snapshots a [`SharedBuffer`] into the store on an interval.

use crate::clock::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[cfg(feature = "disk")]
pub mod disk;

#[cfg(feature = "disk")]
pub use disk::DirBackend;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_millis(3000);

const KEY_PREFIX: &str = "outline_backup_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub content: String,
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub name: String,
    #[serde(flatten)]
    pub record: BackupRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub count: usize,
    pub total_bytes: usize,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backup storage quota exceeded")]
    QuotaExceeded,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt backup: {0}")]
    Corrupt(&'static str),
}

/// String key/value storage underneath a [`BackupStore`].
pub trait BackupBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError>;
    fn write(&self, key: &str, value: &str) -> Result<(), BackendError>;
    fn remove(&self, key: &str) -> Result<(), BackendError>;
    fn keys(&self) -> Result<Vec<String>, BackendError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process backend. With a capacity, writes that would push the summed
/// key and value bytes past it fail with [`BackendError::QuotaExceeded`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    capacity: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            entries: Mutex::default(),
            capacity: Some(bytes),
        }
    }

    pub fn used_bytes(&self) -> usize {
        lock(&self.entries)
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

impl BackupBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut entries = lock(&self.entries);
        if let Some(capacity) = self.capacity {
            let used: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, value)| existing.len() + value.len())
                .sum();
            if used + key.len() + value.len() > capacity {
                return Err(BackendError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}

#[derive(Clone)]
pub struct BackupStore {
    backend: Arc<dyn BackupBackend>,
    clock: Arc<dyn Clock>,
    expiry: Duration,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl BackupStore {
    pub fn new(backend: impl BackupBackend + 'static) -> Self {
        Self::with_clock(backend, SystemClock)
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn with_clock(backend: impl BackupBackend + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            clock: Arc::new(clock),
            expiry: DEFAULT_EXPIRY,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Stores a snapshot of `name`. Failures are logged and swallowed.
    pub fn save(&self, name: &str, content: &str, version: u64) {
        self.clean_expired();

        let record = BackupRecord {
            content: content.to_string(),
            version,
            timestamp: self.clock.now_ms(),
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(document = name, error = %err, "failed to encode backup");
                return;
            }
        };

        let key = storage_key(name);
        match self.backend.write(&key, &encoded) {
            Ok(()) => tracing::debug!(document = name, version, "backup saved"),
            Err(BackendError::QuotaExceeded) => {
                tracing::warn!(document = name, "backup quota exceeded, cleaning and retrying");
                self.clean_expired();
                if let Err(err) = self.backend.write(&key, &encoded) {
                    tracing::warn!(document = name, error = %err, "dropping backup after retry");
                }
            }
            Err(err) => tracing::warn!(document = name, error = %err, "dropping backup"),
        }
    }

    /// Returns the live backup for `name`, removing it if it turns out to be
    /// expired or unreadable.
    pub fn get(&self, name: &str) -> Option<BackupRecord> {
        let key = storage_key(name);
        let raw = match self.backend.read(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(BackendError::Corrupt(reason)) => {
                tracing::warn!(document = name, reason, "discarding corrupt backup");
                self.remove_key(&key);
                return None;
            }
            Err(err) => {
                tracing::warn!(document = name, error = %err, "failed to read backup");
                return None;
            }
        };

        match serde_json::from_str::<BackupRecord>(&raw) {
            Ok(record) if self.is_expired(&record) => {
                tracing::debug!(document = name, "backup expired");
                self.remove_key(&key);
                None
            }
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(document = name, error = %err, "discarding unreadable backup");
                self.remove_key(&key);
                None
            }
        }
    }

    pub fn clear(&self, name: &str) {
        self.remove_key(&storage_key(name));
    }

    /// Every live backup, newest first.
    pub fn list_all(&self) -> Vec<BackupEntry> {
        let mut entries: Vec<BackupEntry> = self
            .document_names()
            .into_iter()
            .filter_map(|name| {
                self.get(&name)
                    .map(|record| BackupEntry { name, record })
            })
            .collect();
        entries.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        entries
    }

    /// Removes expired and unparsable records. Returns how many were removed.
    pub fn clean_expired(&self) -> usize {
        let mut stale = Vec::new();
        for key in self.backup_keys() {
            let expired = match self.backend.read(&key) {
                Ok(Some(raw)) => serde_json::from_str::<BackupRecord>(&raw)
                    .map(|record| self.is_expired(&record))
                    .unwrap_or(true),
                Ok(None) => false,
                Err(BackendError::Corrupt(_)) => true,
                Err(_) => false,
            };
            if expired {
                stale.push(key);
            }
        }

        for key in &stale {
            self.remove_key(key);
        }
        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), "cleaned expired backups");
        }
        stale.len()
    }

    pub fn clear_all(&self) -> usize {
        let keys = self.backup_keys();
        for key in &keys {
            self.remove_key(key);
        }
        keys.len()
    }

    pub fn stats(&self) -> BackupStats {
        let entries = self.list_all();
        let timestamps = entries.iter().map(|entry| entry.record.timestamp);
        BackupStats {
            count: entries.len(),
            total_bytes: entries.iter().map(|entry| entry.record.content.len()).sum(),
            oldest: timestamps.clone().min(),
            newest: timestamps.max(),
        }
    }

    /// True when a live backup exists at or past `server_version`.
    pub fn is_newer_than_server(&self, name: &str, server_version: u64) -> bool {
        self.get(name)
            .is_some_and(|record| record.version >= server_version)
    }

    fn is_expired(&self, record: &BackupRecord) -> bool {
        let age = self.clock.now_ms().saturating_sub(record.timestamp);
        u128::from(age) > self.expiry.as_millis()
    }

    fn backup_keys(&self) -> Vec<String> {
        match self.backend.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|key| key.starts_with(KEY_PREFIX))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list backups");
                Vec::new()
            }
        }
    }

    fn document_names(&self) -> Vec<String> {
        self.backup_keys()
            .into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect()
    }

    fn remove_key(&self, key: &str) {
        if let Err(err) = self.backend.remove(key) {
            tracing::warn!(key, error = %err, "failed to remove backup");
        }
    }
}

fn storage_key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

/// The document currently being edited, shared between an editing session
/// and its autosave thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferState {
    pub name: Option<String>,
    pub content: String,
    pub version: u64,
    pub dirty: bool,
}

impl BufferState {
    fn needs_backup(&self) -> bool {
        self.dirty && !self.content.is_empty() && self.name.as_deref().is_some_and(|name| !name.is_empty())
    }
}

pub type SharedBuffer = Arc<Mutex<BufferState>>;

/// Periodic backup of a [`SharedBuffer`] on a background thread.
#[derive(Debug)]
pub struct Autosave {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Autosave {
    pub fn start(store: BackupStore, buffer: SharedBuffer, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        Self::tick(&store, &buffer);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Performs one autosave fire. Returns whether a snapshot was written.
    pub fn tick(store: &BackupStore, buffer: &SharedBuffer) -> bool {
        let snapshot = {
            let state = lock(buffer);
            if !state.needs_backup() {
                return false;
            }
            (state.name.clone().unwrap_or_default(), state.content.clone(), state.version)
        };
        let (name, content, version) = snapshot;
        store.save(&name, &content, version);
        true
    }

    /// Stops the timer and waits for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("autosave thread panicked");
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn store_at(start_ms: u64) -> (BackupStore, ManualClock) {
        let clock = ManualClock::new(start_ms);
        (BackupStore::with_clock(MemoryBackend::new(), clock.clone()), clock)
    }

    #[test]
    fn save_then_get() {
        let (store, _) = store_at(1_000);
        store.save("doc", "# A", 3);
        assert_eq!(
            store.get("doc"),
            Some(BackupRecord {
                content: "# A".into(),
                version: 3,
                timestamp: 1_000,
            })
        );
        store.clear("doc");
        assert_eq!(store.get("doc"), None);
    }

    #[test]
    fn expired_backup_is_removed_on_read() {
        let (store, clock) = store_at(0);
        store.save("doc", "old", 1);
        clock.advance(7 * DAY);
        assert!(store.get("doc").is_some());
        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("doc"), None);
        assert!(store.backup_keys().is_empty());
    }

    #[test]
    fn save_sweeps_expired_records() {
        let (store, clock) = store_at(0);
        store.save("old", "x", 1);
        clock.advance(8 * DAY);
        store.save("new", "y", 1);
        assert_eq!(store.document_names(), vec!["new".to_string()]);
    }

    #[test]
    fn clean_expired_drops_unparsable_records() {
        let backend = MemoryBackend::new();
        backend.write(&storage_key("broken"), "{not json").unwrap();
        backend.write("unrelated", "keep").unwrap();
        let store = BackupStore::new(backend);
        store.save("ok", "text", 1);
        assert_eq!(store.clean_expired(), 0);
        assert_eq!(store.document_names(), vec!["ok".to_string()]);
        assert_eq!(store.clear_all(), 1);
        assert_eq!(store.backend.read("unrelated").unwrap().as_deref(), Some("keep"));
    }

    #[test]
    fn list_all_is_newest_first_and_stats_summarise() {
        let (store, clock) = store_at(10);
        store.save("a", "aa", 1);
        clock.advance(Duration::from_millis(5));
        store.save("b", "bbb", 2);
        let names: Vec<_> = store.list_all().into_iter().map(|entry| entry.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(
            store.stats(),
            BackupStats {
                count: 2,
                total_bytes: 5,
                oldest: Some(10),
                newest: Some(15),
            }
        );
    }

    #[test]
    fn newer_than_server_compares_versions() {
        let (store, _) = store_at(0);
        assert!(!store.is_newer_than_server("doc", 1));
        store.save("doc", "text", 4);
        assert!(store.is_newer_than_server("doc", 4));
        assert!(!store.is_newer_than_server("doc", 5));
    }

    struct RejectingBackend {
        inner: MemoryBackend,
        rejections_left: AtomicUsize,
    }

    impl BackupBackend for RejectingBackend {
        fn read(&self, key: &str) -> Result<Option<String>, BackendError> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str) -> Result<(), BackendError> {
            let left = self.rejections_left.load(Ordering::SeqCst);
            if left > 0 {
                self.rejections_left.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::QuotaExceeded);
            }
            self.inner.write(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), BackendError> {
            self.inner.remove(key)
        }

        fn keys(&self) -> Result<Vec<String>, BackendError> {
            self.inner.keys()
        }
    }

    #[test]
    fn quota_failure_is_retried_once() {
        let store = BackupStore::new(RejectingBackend {
            inner: MemoryBackend::new(),
            rejections_left: AtomicUsize::new(1),
        });
        store.save("doc", "text", 1);
        assert_eq!(store.get("doc").map(|record| record.content), Some("text".into()));
    }

    #[test]
    fn persistent_quota_failure_drops_the_write() {
        let store = BackupStore::new(RejectingBackend {
            inner: MemoryBackend::new(),
            rejections_left: AtomicUsize::new(usize::MAX),
        });
        store.save("doc", "text", 1);
        assert_eq!(store.get("doc"), None);
    }

    #[test]
    fn memory_capacity_is_enforced() {
        let backend = MemoryBackend::with_capacity(8);
        assert!(backend.write("k", "1234567").is_ok());
        assert!(matches!(
            backend.write("j", "x"),
            Err(BackendError::QuotaExceeded)
        ));
        assert!(backend.write("k", "7654321").is_ok());
        assert_eq!(backend.used_bytes(), 8);
    }

    #[test]
    fn tick_only_backs_up_dirty_named_content() {
        let (store, _) = store_at(0);
        let buffer: SharedBuffer = Arc::default();
        assert!(!Autosave::tick(&store, &buffer));

        {
            let mut state = buffer.lock().unwrap();
            state.name = Some("doc".into());
            state.content = "draft".into();
            state.version = 2;
        }
        assert!(!Autosave::tick(&store, &buffer));

        buffer.lock().unwrap().dirty = true;
        assert!(Autosave::tick(&store, &buffer));
        assert_eq!(store.get("doc").map(|record| record.version), Some(2));

        buffer.lock().unwrap().content.clear();
        store.clear("doc");
        assert!(!Autosave::tick(&store, &buffer));
        assert_eq!(store.get("doc"), None);
    }

    #[test]
    fn autosave_thread_writes_and_stops() {
        let store = BackupStore::in_memory();
        let buffer: SharedBuffer = Arc::new(Mutex::new(BufferState {
            name: Some("doc".into()),
            content: "draft".into(),
            version: 1,
            dirty: true,
        }));
        let autosave = Autosave::start(store.clone(), buffer.clone(), Duration::from_millis(5));
        let mut waited = Duration::ZERO;
        while store.get("doc").is_none() && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        autosave.stop();
        assert_eq!(store.get("doc").map(|record| record.content), Some("draft".into()));

        store.clear("doc");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("doc"), None);
    }
}
