//! convoy-backup: point-in-time archives of cluster state.
//!
//! A backup is a tar file (gzip when the path ends in `.gz`) holding a
//! manifest and one JSON document per state table. Only `file://`
//! locations are supported.

pub mod archive;
pub mod error;
pub mod service;
pub mod uri;

pub use archive::{BackupManifest, BackupSummary};
pub use error::{BackupError, BackupResult};
pub use service::BackupService;
pub use uri::BackupUri;
