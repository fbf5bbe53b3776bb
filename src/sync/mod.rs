//! Optimistic version reconciliation for saves.
//!
//! Before a save, the local version is compared with the version the remote
//! store currently serves. A stale local copy is handed to a
//! [`ConflictResolver`], which decides whether to overwrite, refresh from the
//! remote, or cancel. A failed check never blocks a save.

use crate::remote::{Prompt, RemoteStore};
use serde::Serialize;
use std::sync::Arc;

mod session;

pub use session::{Opened, PendingSave, SaveOutcome, SaveReport, Session, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionCheck {
    pub local_version: u64,
    pub remote_version: u64,
    pub is_stale: bool,
}

impl VersionCheck {
    pub fn compare(local_version: u64, remote_version: u64) -> Self {
        Self {
            local_version,
            remote_version,
            is_stale: local_version < remote_version,
        }
    }

    /// A check that could not reach the remote and assumes the local copy is
    /// current.
    pub fn assume_current(local_version: u64) -> Self {
        Self::compare(local_version, local_version)
    }
}

/// Progress of one save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    NotChecked,
    Checking,
    /// Local version is at or past the remote's.
    Current,
    /// The remote moved on since the document was loaded.
    Stale,
    Proceed,
    Refreshed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move reconciliation from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: Reconciliation,
    pub to: Reconciliation,
}

impl Reconciliation {
    pub fn can_advance_to(self, to: Reconciliation) -> bool {
        use Reconciliation::*;
        matches!(
            (self, to),
            (NotChecked, Checking)
                | (NotChecked, Proceed)
                | (Checking, Current)
                | (Checking, Stale)
                | (Current, Proceed)
                | (Stale, Proceed)
                | (Stale, Refreshed)
                | (Stale, Cancelled)
        )
    }

    pub fn advance(&mut self, to: Reconciliation) -> Result<(), TransitionError> {
        if !self.can_advance_to(to) {
            return Err(TransitionError { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Reconciliation::Proceed | Reconciliation::Refreshed | Reconciliation::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Save anyway; the remote gets a new version on top of the newer one.
    Overwrite,
    /// Drop local edits and load the remote's latest content.
    Refresh,
    Cancel,
}

/// Decides what to do when the local copy is stale.
pub trait ConflictResolver {
    fn resolve(&mut self, check: &VersionCheck) -> ConflictChoice;
}

impl<F> ConflictResolver for F
where
    F: FnMut(&VersionCheck) -> ConflictChoice,
{
    fn resolve(&mut self, check: &VersionCheck) -> ConflictChoice {
        self(check)
    }
}

impl ConflictResolver for ConflictChoice {
    fn resolve(&mut self, _check: &VersionCheck) -> ConflictChoice {
        *self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveDecision {
    Proceed,
    /// The save was abandoned in favour of the remote's latest document.
    Refreshed(Prompt),
    Cancelled,
}

#[derive(Clone)]
pub struct Reconciler {
    remote: Arc<dyn RemoteStore>,
    label: String,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(remote: Arc<dyn RemoteStore>, label: impl Into<String>) -> Self {
        Self {
            remote,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Compares `local_version` with the remote. Any failure to fetch the
    /// remote version reports the local copy as current.
    pub fn check_version(&self, name: &str, local_version: u64) -> VersionCheck {
        match self.remote.get_prompt(name, Some(&self.label), None) {
            Ok(prompt) => VersionCheck::compare(local_version, prompt.version),
            Err(err) => {
                tracing::warn!(document = name, error = %err, "version check failed, assuming current");
                VersionCheck::assume_current(local_version)
            }
        }
    }

    pub fn check_and_confirm_save(
        &self,
        name: &str,
        local_version: u64,
        resolver: &mut dyn ConflictResolver,
    ) -> SaveDecision {
        self.reconcile(name, local_version, resolver)
            .unwrap_or_else(|err| {
                tracing::error!(document = name, error = %err, "reconciliation failed, cancelling save");
                SaveDecision::Cancelled
            })
    }

    fn reconcile(
        &self,
        name: &str,
        local_version: u64,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<SaveDecision, TransitionError> {
        let mut state = Reconciliation::NotChecked;
        if local_version == 0 {
            // Never saved, so there is nothing to conflict with.
            state.advance(Reconciliation::Proceed)?;
            return Ok(SaveDecision::Proceed);
        }

        state.advance(Reconciliation::Checking)?;
        let check = self.check_version(name, local_version);
        if !check.is_stale {
            state.advance(Reconciliation::Current)?;
            state.advance(Reconciliation::Proceed)?;
            return Ok(SaveDecision::Proceed);
        }

        state.advance(Reconciliation::Stale)?;
        let choice = resolver.resolve(&check);
        tracing::debug!(
            document = name,
            local = check.local_version,
            remote = check.remote_version,
            ?choice,
            "stale save resolved"
        );

        match choice {
            ConflictChoice::Overwrite => {
                state.advance(Reconciliation::Proceed)?;
                Ok(SaveDecision::Proceed)
            }
            ConflictChoice::Refresh => match self.remote.get_prompt(name, Some(&self.label), None) {
                Ok(prompt) => {
                    state.advance(Reconciliation::Refreshed)?;
                    Ok(SaveDecision::Refreshed(prompt))
                }
                Err(err) => {
                    tracing::warn!(document = name, error = %err, "refresh failed, keeping local edits");
                    state.advance(Reconciliation::Cancelled)?;
                    Ok(SaveDecision::Cancelled)
                }
            },
            ConflictChoice::Cancel => {
                state.advance(Reconciliation::Cancelled)?;
                Ok(SaveDecision::Cancelled)
            }
        }
    }
}
