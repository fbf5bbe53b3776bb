use super::{ConflictResolver, Reconciler, SaveDecision};
use crate::backup::{
    Autosave, BackupRecord, BackupStore, BufferState, DEFAULT_AUTOSAVE_INTERVAL, SharedBuffer,
};
use crate::config::Config;
use crate::doc::{CodecConfig, Parsed, Parser};
use crate::remote::{
    DEFAULT_LABEL, PromptListItem, PromptVersion, RemoteError, RemoteStore, SaveRequest,
};
use crate::tree::Tree;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no document is open")]
    NoDocument,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("save rejected: {0}")]
    SaveRejected(String),
    #[error(transparent)]
    Transition(#[from] super::TransitionError),
}

/// What `open` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub version: u64,
    /// The live local backup, left for the caller to restore or dismiss.
    pub backup: Option<BackupRecord>,
    /// Set when the backup was taken from a version older than the loaded
    /// one, so restoring it would overwrite newer remote edits.
    pub behind_remote: bool,
}

/// Snapshot of a save taken before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSave {
    pub name: String,
    pub content: String,
    pub version: u64,
    pub commit_message: String,
    pub label: String,
}

#[derive(Debug)]
pub enum SaveOutcome {
    Saved {
        name: String,
        version: u64,
        content: String,
    },
    Refreshed {
        name: String,
        version: u64,
        content: String,
    },
    Cancelled {
        name: String,
    },
    Failed {
        name: String,
        error: SessionError,
    },
}

impl SaveOutcome {
    pub fn name(&self) -> &str {
        match self {
            SaveOutcome::Saved { name, .. }
            | SaveOutcome::Refreshed { name, .. }
            | SaveOutcome::Cancelled { name }
            | SaveOutcome::Failed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReport {
    Saved { version: u64 },
    Refreshed { version: u64 },
    Cancelled,
}

impl PendingSave {
    /// Runs the version check and, when it allows, the write. The check
    /// always completes before the write is issued.
    pub fn execute(
        &self,
        remote: &dyn RemoteStore,
        reconciler: &Reconciler,
        resolver: &mut dyn ConflictResolver,
    ) -> SaveOutcome {
        let name = self.name.clone();
        match reconciler.check_and_confirm_save(&self.name, self.version, resolver) {
            SaveDecision::Proceed => {}
            SaveDecision::Refreshed(prompt) => {
                return SaveOutcome::Refreshed {
                    name,
                    version: prompt.version,
                    content: prompt.content,
                };
            }
            SaveDecision::Cancelled => return SaveOutcome::Cancelled { name },
        }

        let request = SaveRequest::new(self.content.clone())
            .with_commit_message(self.commit_message.clone())
            .with_labels([self.label.clone()]);
        match remote.save_prompt(&self.name, &request) {
            Ok(response) if response.success => SaveOutcome::Saved {
                name,
                version: response.version,
                content: self.content.clone(),
            },
            Ok(response) => SaveOutcome::Failed {
                name,
                error: SessionError::SaveRejected(
                    response.error.unwrap_or_else(|| "remote refused the save".into()),
                ),
            },
            Err(err) => SaveOutcome::Failed {
                name,
                error: err.into(),
            },
        }
    }
}

/// Editing state for one open document at a time.
///
/// The session owns the buffer, keeps an autosave thread snapshotting it into
/// the backup store, and runs saves through the [`Reconciler`].
pub struct Session {
    remote: Arc<dyn RemoteStore>,
    backups: BackupStore,
    reconciler: Reconciler,
    codec: CodecConfig,
    label: String,
    autosave_interval: Option<Duration>,
    buffer: SharedBuffer,
    /// Content as last loaded or saved; the buffer is dirty when it differs.
    original: String,
    autosave: Option<Autosave>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.label)
            .field("buffer", &*self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(remote: Arc<dyn RemoteStore>, backups: BackupStore) -> Self {
        let reconciler = Reconciler::new(remote.clone(), DEFAULT_LABEL);
        Self {
            remote,
            backups,
            reconciler,
            codec: CodecConfig::default(),
            label: DEFAULT_LABEL.to_string(),
            autosave_interval: Some(DEFAULT_AUTOSAVE_INTERVAL),
            buffer: Arc::new(Mutex::new(BufferState::default())),
            original: String::new(),
            autosave: None,
        }
    }

    pub fn from_config(config: &Config, remote: Arc<dyn RemoteStore>, backups: BackupStore) -> Self {
        Self::new(remote, backups)
            .with_codec(config.codec())
            .with_label(config.remote.default_label.clone())
            .with_autosave_interval(Some(config.backup.interval()))
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self.reconciler = Reconciler::new(self.remote.clone(), self.label.clone());
        self
    }

    /// `None` turns autosave off.
    pub fn with_autosave_interval(mut self, interval: Option<Duration>) -> Self {
        self.autosave_interval = interval;
        self
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> Option<String> {
        self.state().name.clone()
    }

    pub fn content(&self) -> String {
        self.state().content.clone()
    }

    pub fn version(&self) -> u64 {
        self.state().version
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn snapshot(&self) -> BufferState {
        self.state().clone()
    }

    /// Loads `name` from the remote and makes it the open document.
    pub fn open(&mut self, name: &str) -> Result<Opened, SessionError> {
        let prompt = self.remote.get_prompt(name, Some(&self.label), None)?;
        self.load(name, prompt.content, prompt.version);

        let backup = self.backups.get(name);
        let behind_remote = backup
            .as_ref()
            .is_some_and(|backup| backup.version < prompt.version);
        if behind_remote {
            tracing::warn!(document = name, version = prompt.version, "local backup predates the remote version");
        }
        tracing::debug!(document = name, version = prompt.version, has_backup = backup.is_some(), "document opened");
        Ok(Opened {
            version: prompt.version,
            backup,
            behind_remote,
        })
    }

    /// Starts a document that does not exist remotely yet. Its version is 0
    /// until the first save.
    pub fn create(&mut self, name: &str, content: &str) {
        self.load(name, String::new(), 0);
        self.set_buffer_content(content.to_string());
    }

    fn load(&mut self, name: &str, content: String, version: u64) {
        self.stop_autosave();
        {
            let mut state = self.state();
            *state = BufferState {
                name: Some(name.to_string()),
                content: content.clone(),
                version,
                dirty: false,
            };
        }
        self.original = content;
        self.start_autosave();
    }

    pub fn set_content(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        if self.name().is_none() {
            return Err(SessionError::NoDocument);
        }
        self.set_buffer_content(text.into());
        Ok(())
    }

    /// Marks the buffer as edited from `version` instead of the loaded one,
    /// for text that was written against an older copy of the document.
    pub fn set_base_version(&mut self, version: u64) -> Result<(), SessionError> {
        let mut state = self.state();
        if state.name.is_none() {
            return Err(SessionError::NoDocument);
        }
        state.version = version;
        Ok(())
    }

    fn set_buffer_content(&mut self, text: String) {
        let mut state = self.state();
        state.dirty = text != self.original;
        state.content = text;
    }

    pub fn tree(&self) -> Result<Parsed, SessionError> {
        let state = self.state();
        let name = state.name.as_deref().ok_or(SessionError::NoDocument)?;
        Ok(Parser::parse_with_config(&state.content, name, &self.codec))
    }

    pub fn apply_tree(&mut self, tree: &Tree) -> Result<(), SessionError> {
        self.set_content(tree.serialize(&self.codec))
    }

    /// Replaces the buffer with the open document's backup. The restored text
    /// always counts as unsaved.
    pub fn restore_backup(&mut self) -> Result<Option<BackupRecord>, SessionError> {
        let name = self.name().ok_or(SessionError::NoDocument)?;
        let Some(backup) = self.backups.get(&name) else {
            return Ok(None);
        };
        {
            let mut state = self.state();
            state.content = backup.content.clone();
            state.version = backup.version;
            state.dirty = true;
        }
        self.original.clear();
        Ok(Some(backup))
    }

    pub fn dismiss_backup(&mut self) -> Result<(), SessionError> {
        let name = self.name().ok_or(SessionError::NoDocument)?;
        self.backups.clear(&name);
        Ok(())
    }

    /// Snapshots the buffer for a save and backs it up first.
    pub fn begin_save(&self, commit_message: Option<&str>) -> Result<PendingSave, SessionError> {
        let state = self.state();
        let name = state.name.clone().ok_or(SessionError::NoDocument)?;
        let pending = PendingSave {
            commit_message: commit_message
                .map(str::to_string)
                .unwrap_or_else(|| format!("Update {name}")),
            content: state.content.clone(),
            version: state.version,
            label: self.label.clone(),
            name,
        };
        drop(state);

        self.backups
            .save(&pending.name, &pending.content, pending.version);
        Ok(pending)
    }

    /// Applies a finished save. The backup of the saved document is cleared
    /// either way, but the buffer only changes if it still holds that document.
    pub fn finish_save(&mut self, outcome: SaveOutcome) -> Result<SaveReport, SessionError> {
        let targeted = self.name().as_deref() == Some(outcome.name());
        match outcome {
            SaveOutcome::Saved {
                name,
                version,
                content,
            } => {
                self.backups.clear(&name);
                if targeted {
                    {
                        let mut state = self.state();
                        state.version = version;
                        state.dirty = state.content != content;
                    }
                    self.original = content;
                } else {
                    tracing::debug!(document = %name, "save finished after switching documents");
                }
                Ok(SaveReport::Saved { version })
            }
            SaveOutcome::Refreshed {
                name,
                version,
                content,
            } => {
                if targeted {
                    {
                        let mut state = self.state();
                        state.content = content.clone();
                        state.version = version;
                        state.dirty = false;
                    }
                    self.original = content;
                } else {
                    tracing::debug!(document = %name, "refresh finished after switching documents");
                }
                Ok(SaveReport::Refreshed { version })
            }
            SaveOutcome::Cancelled { .. } => Ok(SaveReport::Cancelled),
            SaveOutcome::Failed { name, error } => {
                tracing::warn!(document = %name, error = %error, "save failed");
                Err(error)
            }
        }
    }

    pub fn save(
        &mut self,
        commit_message: Option<&str>,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<SaveReport, SessionError> {
        let pending = self.begin_save(commit_message)?;
        let outcome = pending.execute(self.remote.as_ref(), &self.reconciler, resolver);
        self.finish_save(outcome)
    }

    /// Lists remote documents. Failures other than a missing configuration
    /// come back as an empty list.
    pub fn list_documents(&self) -> Result<Vec<PromptListItem>, SessionError> {
        match self.remote.list_prompts() {
            Ok(items) => Ok(items),
            Err(RemoteError::NotConfigured) => Err(RemoteError::NotConfigured.into()),
            Err(err) => {
                tracing::warn!(error = %err, "listing documents failed");
                Ok(Vec::new())
            }
        }
    }

    pub fn history(&self, name: &str) -> Vec<PromptVersion> {
        self.remote.get_prompt_versions(name).unwrap_or_else(|err| {
            tracing::warn!(document = name, error = %err, "loading history failed");
            Vec::new()
        })
    }

    pub fn delete(&self, name: &str) -> bool {
        match self.remote.delete_prompt(name) {
            Ok(deleted) => {
                if deleted {
                    self.backups.clear(name);
                }
                deleted
            }
            Err(err) => {
                tracing::warn!(document = name, error = %err, "delete failed");
                false
            }
        }
    }

    pub fn close(&mut self) {
        self.stop_autosave();
        *self.state() = BufferState::default();
        self.original.clear();
    }

    fn start_autosave(&mut self) {
        if let Some(interval) = self.autosave_interval {
            self.autosave = Some(Autosave::start(
                self.backups.clone(),
                self.buffer.clone(),
                interval,
            ));
        }
    }

    fn stop_autosave(&mut self) {
        if let Some(autosave) = self.autosave.take() {
            autosave.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use crate::sync::ConflictChoice;
    use crate::tree::{NewSection, NodeId};

    fn setup(versions: u64) -> (Arc<InMemoryRemote>, Session) {
        let remote = Arc::new(InMemoryRemote::new());
        for n in 1..=versions {
            remote
                .save_prompt("doc", &SaveRequest::new(format!("# V{n}\n")).with_labels([DEFAULT_LABEL]))
                .unwrap();
        }
        let session = Session::new(remote.clone(), BackupStore::in_memory()).with_autosave_interval(None);
        (remote, session)
    }

    #[test]
    fn open_edit_save_clears_backup() {
        let (remote, mut session) = setup(1);
        let opened = session.open("doc").unwrap();
        assert_eq!(
            opened,
            Opened {
                version: 1,
                backup: None,
                behind_remote: false
            }
        );
        assert!(!session.is_dirty());

        session.set_content("# V1\n\nmore").unwrap();
        assert!(session.is_dirty());
        session.set_content("# V1\n").unwrap();
        assert!(!session.is_dirty());
        session.set_content("# Edited").unwrap();

        let pending = session.begin_save(None).unwrap();
        assert_eq!(pending.commit_message, "Update doc");
        assert!(session.backups().get("doc").is_some());

        let outcome = pending.execute(remote.as_ref(), session.reconciler(), &mut ConflictChoice::Cancel);
        assert_eq!(session.finish_save(outcome).unwrap(), SaveReport::Saved { version: 2 });
        assert_eq!(session.version(), 2);
        assert!(!session.is_dirty());
        assert!(session.backups().get("doc").is_none());
        assert_eq!(remote.get_prompt("doc", None, None).unwrap().content, "# Edited");
    }

    #[test]
    fn stale_save_with_refresh_takes_remote_content() {
        let (remote, mut session) = setup(3);
        session.open("doc").unwrap();
        session.set_content("local edits").unwrap();
        for n in 4..=5 {
            remote
                .save_prompt("doc", &SaveRequest::new(format!("# V{n}\n")).with_labels([DEFAULT_LABEL]))
                .unwrap();
        }

        let mut seen = None;
        let mut resolver = |check: &crate::sync::VersionCheck| {
            seen = Some(*check);
            ConflictChoice::Refresh
        };
        let report = session.save(Some("mine"), &mut resolver).unwrap();
        assert_eq!(report, SaveReport::Refreshed { version: 5 });
        assert_eq!(seen.map(|check| (check.local_version, check.remote_version, check.is_stale)), Some((3, 5, true)));
        assert_eq!(session.content(), "# V5\n");
        assert_eq!(session.version(), 5);
        assert!(!session.is_dirty());
        assert_eq!(remote.get_prompt_versions("doc").unwrap().len(), 5);
    }

    #[test]
    fn overwrite_creates_a_new_version() {
        let (remote, mut session) = setup(2);
        session.open("doc").unwrap();
        remote.save_prompt("doc", &SaveRequest::new("other").with_labels([DEFAULT_LABEL])).unwrap();
        session.set_content("mine").unwrap();
        let report = session.save(None, &mut ConflictChoice::Overwrite).unwrap();
        assert_eq!(report, SaveReport::Saved { version: 4 });
        assert_eq!(remote.get_prompt("doc", None, None).unwrap().content, "mine");
    }

    #[test]
    fn cancel_keeps_local_edits() {
        let (remote, mut session) = setup(1);
        session.open("doc").unwrap();
        remote.save_prompt("doc", &SaveRequest::new("other").with_labels([DEFAULT_LABEL])).unwrap();
        session.set_content("mine").unwrap();
        assert_eq!(session.save(None, &mut ConflictChoice::Cancel).unwrap(), SaveReport::Cancelled);
        assert_eq!(session.content(), "mine");
        assert!(session.is_dirty());
        assert_eq!(session.backups().get("doc").map(|backup| backup.content), Some("mine".into()));
    }

    #[test]
    fn finishing_a_save_after_switching_documents_leaves_the_buffer_alone() {
        let (remote, mut session) = setup(1);
        remote.save_prompt("other", &SaveRequest::new("B").with_labels([DEFAULT_LABEL])).unwrap();
        session.open("doc").unwrap();
        session.set_content("A edited").unwrap();
        let pending = session.begin_save(None).unwrap();

        session.open("other").unwrap();
        session.set_content("B edited").unwrap();

        let outcome = pending.execute(remote.as_ref(), session.reconciler(), &mut ConflictChoice::Cancel);
        assert_eq!(session.finish_save(outcome).unwrap(), SaveReport::Saved { version: 2 });
        assert_eq!(session.name().as_deref(), Some("other"));
        assert_eq!(session.content(), "B edited");
        assert_eq!(session.version(), 1);
        assert!(session.is_dirty());
        assert!(session.backups().get("doc").is_none());
    }

    #[test]
    fn failed_save_surfaces_error_and_keeps_backup() {
        let (remote, mut session) = setup(1);
        session.open("doc").unwrap();
        session.set_content("unsaved").unwrap();
        remote.set_available(false);
        let err = session.save(None, &mut ConflictChoice::Cancel).unwrap_err();
        assert!(matches!(err, SessionError::Remote(RemoteError::Unavailable(_))));
        assert_eq!(session.backups().get("doc").map(|backup| backup.content), Some("unsaved".into()));
        assert!(session.is_dirty());
    }

    #[test]
    fn open_reports_current_backups() {
        let (remote, mut session) = setup(2);
        session.backups().save("doc", "crash draft", 2);
        let opened = session.open("doc").unwrap();
        assert_eq!(opened.backup.map(|backup| backup.content), Some("crash draft".into()));

        let restored = session.restore_backup().unwrap().unwrap();
        assert_eq!(restored.version, 2);
        assert_eq!(session.content(), "crash draft");
        assert!(session.is_dirty());

        session.dismiss_backup().unwrap();
        assert!(session.backups().get("doc").is_none());
    }

    #[test]
    fn open_keeps_backups_older_than_the_remote() {
        let (remote, mut session) = setup(3);
        session.backups().save("doc", "unsaved crash edits", 3);
        remote.save_prompt("doc", &SaveRequest::new("# V4\n").with_labels([DEFAULT_LABEL])).unwrap();

        let opened = session.open("doc").unwrap();
        assert_eq!(opened.version, 4);
        assert!(opened.behind_remote);
        assert_eq!(
            opened.backup.map(|backup| backup.content),
            Some("unsaved crash edits".into())
        );
        assert_eq!(
            session.backups().get("doc").map(|backup| backup.version),
            Some(3)
        );

        // Reopening does not consume it either.
        assert!(session.open("doc").unwrap().backup.is_some());
        let restored = session.restore_backup().unwrap().unwrap();
        assert_eq!(restored.content, "unsaved crash edits");
        assert_eq!(session.content(), "unsaved crash edits");
    }

    #[test]
    fn edits_from_an_older_base_hit_the_version_check() {
        let (remote, mut session) = setup(3);
        session.open("doc").unwrap();
        session.set_content("# Edited offline\n").unwrap();
        session.set_base_version(2).unwrap();

        let mut seen = Vec::new();
        let report = session
            .save(None, &mut |check: &crate::sync::VersionCheck| {
                seen.push(*check);
                ConflictChoice::Cancel
            })
            .unwrap();
        assert_eq!(report, SaveReport::Cancelled);
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].local_version, seen[0].remote_version), (2, 3));
        assert_eq!(session.backups().get("doc").map(|backup| backup.version), Some(2));

        let report = session.save(None, &mut ConflictChoice::Overwrite).unwrap();
        assert_eq!(report, SaveReport::Saved { version: 4 });
        assert_eq!(remote.get_prompt("doc", None, None).unwrap().content, "# Edited offline\n");
    }

    #[test]
    fn base_version_needs_an_open_document() {
        let (_, mut session) = setup(1);
        assert!(matches!(session.set_base_version(1), Err(SessionError::NoDocument)));
    }

    #[test]
    fn new_documents_save_without_a_version_check() {
        let remote = Arc::new(InMemoryRemote::new());
        let mut session = Session::new(remote.clone(), BackupStore::in_memory()).with_autosave_interval(None);
        session.create("fresh", "# Hello");
        assert_eq!(session.version(), 0);
        assert!(session.is_dirty());
        let report = session.save(Some("first"), &mut ConflictChoice::Cancel).unwrap();
        assert_eq!(report, SaveReport::Saved { version: 1 });
        assert_eq!(session.history("fresh")[0].commit_message, "first");
    }

    #[test]
    fn tree_edits_round_trip_through_the_buffer() {
        let (_, mut session) = setup(1);
        session.open("doc").unwrap();
        let mut tree = session.tree().unwrap().into_tree();
        let top = tree.children(NodeId::ROOT)[0];
        tree.add_child(top, NewSection::new("Child").with_content("text")).unwrap();
        session.apply_tree(&tree).unwrap();
        assert_eq!(session.content(), "# V1\n\n\n\n## Child\n\ntext\n\n");
        assert!(session.is_dirty());
    }

    #[test]
    fn listing_fails_empty_but_reports_missing_configuration() {
        struct Unconfigured;
        impl RemoteStore for Unconfigured {
            fn get_prompt(&self, _: &str, _: Option<&str>, _: Option<u64>) -> Result<crate::remote::Prompt, RemoteError> {
                Err(RemoteError::NotConfigured)
            }
            fn save_prompt(&self, _: &str, _: &SaveRequest) -> Result<crate::remote::SaveResponse, RemoteError> {
                Err(RemoteError::NotConfigured)
            }
            fn list_prompts(&self) -> Result<Vec<PromptListItem>, RemoteError> {
                Err(RemoteError::NotConfigured)
            }
            fn get_prompt_versions(&self, _: &str) -> Result<Vec<PromptVersion>, RemoteError> {
                Err(RemoteError::NotConfigured)
            }
        }

        let session = Session::new(Arc::new(Unconfigured), BackupStore::in_memory());
        assert!(matches!(
            session.list_documents(),
            Err(SessionError::Remote(RemoteError::NotConfigured))
        ));
        assert!(session.history("doc").is_empty());
        assert!(!session.delete("doc"));

        let (remote, session) = setup(1);
        remote.set_available(false);
        assert!(session.list_documents().unwrap().is_empty());
    }

    #[test]
    fn operations_without_a_document_fail() {
        let (_, mut session) = setup(0);
        assert!(matches!(session.set_content("x"), Err(SessionError::NoDocument)));
        assert!(matches!(session.begin_save(None), Err(SessionError::NoDocument)));
        assert!(matches!(session.tree(), Err(SessionError::NoDocument)));
        session.create("doc", "x");
        session.close();
        assert_eq!(session.name(), None);
        assert_eq!(session.content(), "");
    }

    #[test]
    fn autosave_snapshots_the_open_document() {
        let (_, session) = setup(1);
        let mut session = session.with_autosave_interval(Some(Duration::from_millis(5)));
        session.open("doc").unwrap();
        session.set_content("typing").unwrap();
        let mut waited = Duration::ZERO;
        while session.backups().get("doc").is_none() && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
            waited += Duration::from_millis(5);
        }
        session.close();
        assert_eq!(session.backups().get("doc").map(|backup| backup.content), Some("typing".into()));
    }
}
