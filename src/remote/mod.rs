//! Versioned remote document store.
//!
//! Documents live in a prompt-management backend as named, versioned text
//! "prompts". Every save creates a new version; labels select which version a
//! plain read returns. [`RemoteStore`] is the narrow contract the editing
//! session relies on. [`InMemoryRemote`] implements it in process and
//! [`HttpPromptStore`] talks to the REST API.

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpPromptStore;

pub const DEFAULT_LABEL: &str = "production";
pub const LATEST_LABEL: &str = "latest";
pub const DELETED_LABEL: &str = "deleted";
pub const TOMBSTONE_CONTENT: &str = "# [Deleted]\n\nThis document has been deleted.";
pub const DELETE_COMMIT_MESSAGE: &str = "Delete document";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub content: String,
    pub version: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Prompt {
    pub fn commit_message(&self) -> Option<&str> {
        self.config.get("commitMessage").and_then(|value| value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub content: String,
    pub commit_message: Option<String>,
    /// Labels for the new version. Empty means `production` and `latest`.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl SaveRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_commit_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = Some(message.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn effective_labels(&self) -> Vec<String> {
        if self.labels.is_empty() {
            vec![DEFAULT_LABEL.to_string(), LATEST_LABEL.to_string()]
        } else {
            self.labels.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub success: bool,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptListItem {
    pub name: String,
    pub version: u64,
    pub last_updated: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub version: u64,
    pub timestamp: String,
    #[serde(default)]
    pub commit_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store is not configured")]
    NotConfigured,
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store returned {code}: {message}")]
    Status { code: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("document '{0}' not found")]
    NotFound(String),
}

impl RemoteError {
    /// False only for errors that retrying cannot fix without reconfiguration.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RemoteError::NotConfigured)
    }
}

pub trait RemoteStore: Send + Sync {
    /// Fetches a document. `version` wins over `label`; without either the
    /// `production` label is used.
    fn get_prompt(
        &self,
        name: &str,
        label: Option<&str>,
        version: Option<u64>,
    ) -> Result<Prompt, RemoteError>;

    fn save_prompt(&self, name: &str, request: &SaveRequest) -> Result<SaveResponse, RemoteError>;

    /// Current version of every document, most recently updated first.
    fn list_prompts(&self) -> Result<Vec<PromptListItem>, RemoteError>;

    /// Every version of one document, highest first.
    fn get_prompt_versions(&self, name: &str) -> Result<Vec<PromptVersion>, RemoteError>;

    /// Soft-deletes by saving a tombstone version labelled `deleted`.
    fn delete_prompt(&self, name: &str) -> Result<bool, RemoteError> {
        let request = SaveRequest::new(TOMBSTONE_CONTENT)
            .with_commit_message(DELETE_COMMIT_MESSAGE)
            .with_labels([DELETED_LABEL]);
        Ok(self.save_prompt(name, &request)?.success)
    }
}

/// Orders list items newest first. Unparsable timestamps sort last.
pub(crate) fn sort_newest_first(items: &mut [PromptListItem]) {
    items.sort_by(|a, b| {
        let a_time = DateTime::parse_from_rfc3339(&a.last_updated).ok();
        let b_time = DateTime::parse_from_rfc3339(&b.last_updated).ok();
        b_time.cmp(&a_time)
    });
}

#[derive(Debug, Clone)]
struct StoredVersion {
    content: String,
    labels: Vec<String>,
    commit_message: Option<String>,
    created_at: String,
}

/// Versioned store held in memory. Versions start at 1 and each label points
/// at the newest version that carried it.
pub struct InMemoryRemote {
    documents: Mutex<BTreeMap<String, Vec<StoredVersion>>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRemote")
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            documents: Mutex::default(),
            available: AtomicBool::new(true),
            clock: Arc::new(clock),
        }
    }

    /// While unavailable every call fails with [`RemoteError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn documents(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<StoredVersion>>>, RemoteError> {
        if !self.is_available() {
            return Err(RemoteError::Unavailable("remote switched off".into()));
        }
        Ok(self.documents.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn timestamp(&self) -> String {
        let now_ms = i64::try_from(self.clock.now_ms()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(now_ms)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

fn prompt_from(name: &str, version: u64, stored: &StoredVersion) -> Prompt {
    let mut config = serde_json::Map::new();
    if let Some(message) = &stored.commit_message {
        config.insert("commitMessage".into(), serde_json::Value::String(message.clone()));
    }
    Prompt {
        name: name.to_string(),
        content: stored.content.clone(),
        version,
        labels: stored.labels.clone(),
        config,
    }
}

impl RemoteStore for InMemoryRemote {
    fn get_prompt(
        &self,
        name: &str,
        label: Option<&str>,
        version: Option<u64>,
    ) -> Result<Prompt, RemoteError> {
        let documents = self.documents()?;
        let versions = documents
            .get(name)
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;

        let found = match version {
            Some(version) => version
                .checked_sub(1)
                .and_then(|index| versions.get(index as usize))
                .map(|stored| (version, stored)),
            None => {
                let label = label.unwrap_or(DEFAULT_LABEL);
                versions
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|(_, stored)| stored.labels.iter().any(|l| l == label))
                    .map(|(index, stored)| (index as u64 + 1, stored))
            }
        };

        found
            .map(|(version, stored)| prompt_from(name, version, stored))
            .ok_or_else(|| RemoteError::NotFound(name.to_string()))
    }

    fn save_prompt(&self, name: &str, request: &SaveRequest) -> Result<SaveResponse, RemoteError> {
        let created_at = self.timestamp();
        let mut documents = self.documents()?;
        let versions = documents.entry(name.to_string()).or_default();
        let labels = request.effective_labels();

        // A label moves to the newest version, so older versions lose it.
        for older in versions.iter_mut() {
            older.labels.retain(|label| !labels.contains(label));
        }
        versions.push(StoredVersion {
            content: request.content.clone(),
            labels,
            commit_message: request.commit_message.clone(),
            created_at,
        });
        let version = versions.len() as u64;
        tracing::debug!(document = name, version, "saved in-memory version");
        Ok(SaveResponse {
            success: true,
            version,
            error: None,
        })
    }

    fn list_prompts(&self) -> Result<Vec<PromptListItem>, RemoteError> {
        let documents = self.documents()?;
        let mut items: Vec<PromptListItem> = documents
            .iter()
            .filter_map(|(name, versions)| {
                versions.last().map(|latest| PromptListItem {
                    name: name.clone(),
                    version: versions.len() as u64,
                    last_updated: latest.created_at.clone(),
                    labels: latest.labels.clone(),
                })
            })
            .collect();
        sort_newest_first(&mut items);
        Ok(items)
    }

    fn get_prompt_versions(&self, name: &str) -> Result<Vec<PromptVersion>, RemoteError> {
        let documents = self.documents()?;
        let mut versions: Vec<PromptVersion> = documents
            .get(name)
            .map(|versions| {
                versions
                    .iter()
                    .enumerate()
                    .map(|(index, stored)| PromptVersion {
                        version: index as u64 + 1,
                        timestamp: stored.created_at.clone(),
                        commit_message: stored.commit_message.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }
}
