//! md-outline: markdown outline editing with versioned remote sync.
//!
//! A markdown document is edited as a tree of heading sections and stored as
//! numbered versions in a remote prompt store. Local edits are protected by an
//! expiring backup store and by an optimistic version check before each save.
//!
//! - **Tree model** - sections addressed by stable ids, edited in place
//! - **Markdown codec** - lossless parse and serialize with frontmatter
//! - **Backups** - periodic local snapshots with a seven-day expiry
//! - **Sync** - stale-version detection and conflict resolution around saves
//! - **Remote** - the remote store contract, in-memory and HTTP clients
//!
//! # Quick Start
//!
//! ```rust
//! use md_outline::{CodecConfig, NewSection, NodeId, Parser};
//!
//! let mut tree = Parser::parse("# Notes\n\nFirst line\n", "notes").into_tree();
//! let notes = tree.children(NodeId::ROOT)[0];
//! tree.add_child(notes, NewSection::new("Details").with_content("More"))
//!     .unwrap();
//!
//! let markdown = tree.serialize(&CodecConfig::default());
//! assert_eq!(markdown, "# Notes\n\nFirst line\n\n## Details\n\nMore\n\n");
//! ```
//!
//! # Features
//!
//! - `disk` - directory-backed backup storage with checksummed files
//! - `http` - blocking HTTP client for the prompt-management REST API

pub mod backup;
pub mod clock;
pub mod config;
pub mod doc;
pub mod remote;
pub mod sync;
pub mod tree;

pub use backup::{
    Autosave, BackendError, BackupBackend, BackupEntry, BackupRecord, BackupStats, BackupStore,
    BufferState, MemoryBackend, SharedBuffer,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackupConfig, Config, ConfigError, RemoteConfig};
pub use doc::{CodecConfig, CodecError, Parsed, Parser};
pub use remote::{
    InMemoryRemote, Prompt, PromptListItem, PromptVersion, RemoteError, RemoteStore, SaveRequest,
    SaveResponse,
};
pub use sync::{
    ConflictChoice, ConflictResolver, Opened, PendingSave, Reconciler, Reconciliation,
    SaveDecision, SaveOutcome, SaveReport, Session, SessionError, TransitionError, VersionCheck,
};
pub use tree::{NewSection, NodeId, NodeKind, Outline, SectionNode, Tree, TreeError};

#[cfg(feature = "disk")]
pub use backup::DirBackend;

#[cfg(feature = "http")]
pub use remote::HttpPromptStore;
