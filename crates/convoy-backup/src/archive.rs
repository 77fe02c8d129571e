//! Tar archive layout.
//!
//! ```text
//! manifest.json
//! state/apps.json
//! state/pods.json
//! state/deployments.json
//! state/tasks.json
//! ```
//!
//! Every archive carries all five entries, even for an empty cluster.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};
use tempfile::NamedTempFile;
use tracing::debug;

use convoy_state::ClusterState;

use crate::error::{BackupError, BackupResult};
use crate::uri::BackupUri;

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST: &str = "manifest.json";
const APPS: &str = "state/apps.json";
const PODS: &str = "state/pods.json";
const DEPLOYMENTS: &str = "state/deployments.json";
const TASKS: &str = "state/tasks.json";

/// Describes an archive's contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub format_version: u32,
    /// RFC 3339 creation time.
    pub created_at: String,
    pub state_version: u64,
    pub apps: usize,
    pub pods: usize,
    pub deployments: usize,
    pub tasks: usize,
}

impl BackupManifest {
    fn describe(state: &ClusterState) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            state_version: state.version,
            apps: state.apps.len(),
            pods: state.pods.len(),
            deployments: state.deployments.len(),
            tasks: state.tasks.len(),
        }
    }
}

/// Result of writing or verifying an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub uri: String,
    /// Number of tar entries.
    pub entries: usize,
    pub manifest: BackupManifest,
}

/// Write `state` to `uri`. The archive is built beside the target and
/// renamed into place, so readers see either the old file or the new one.
pub fn write_archive(uri: &BackupUri, state: &ClusterState) -> BackupResult<BackupSummary> {
    let manifest = BackupManifest::describe(state);
    let entries = vec![
        (MANIFEST, serde_json::to_vec_pretty(&manifest)?),
        (APPS, serde_json::to_vec(&state.apps)?),
        (PODS, serde_json::to_vec(&state.pods)?),
        (DEPLOYMENTS, serde_json::to_vec(&state.deployments)?),
        (TASKS, serde_json::to_vec(&state.tasks)?),
    ];

    let target = uri.path();
    let dir = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    // Dropped, and so removed, on any error before `persist`.
    let staging = NamedTempFile::new_in(dir)?;
    write_entries(staging.as_file(), uri.is_compressed(), &entries)?;
    staging.persist(target).map_err(|e| e.error)?;

    debug!(%uri, entries = entries.len(), "backup archive written");
    Ok(BackupSummary {
        uri: uri.to_string(),
        entries: entries.len(),
        manifest,
    })
}

fn write_entries(file: &File, compressed: bool, entries: &[(&str, Vec<u8>)]) -> io::Result<()> {
    let file = if compressed {
        let encoder = append_all(Builder::new(GzEncoder::new(file, Compression::default())), entries)?;
        encoder.finish()?
    } else {
        append_all(Builder::new(file), entries)?
    };
    file.sync_all()
}

fn append_all<W: Write>(mut builder: Builder<W>, entries: &[(&str, Vec<u8>)]) -> io::Result<W> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    for (name, data) in entries {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    builder.into_inner()
}

fn read_entries(uri: &BackupUri) -> BackupResult<BTreeMap<String, Vec<u8>>> {
    let file = File::open(uri.path())?;
    if uri.is_compressed() {
        collect(Archive::new(GzDecoder::new(file)))
    } else {
        collect(Archive::new(file))
    }
}

fn collect<R: Read>(mut archive: Archive<R>) -> BackupResult<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.insert(name, data);
    }
    Ok(entries)
}

fn take<T: serde::de::DeserializeOwned>(
    entries: &BTreeMap<String, Vec<u8>>,
    name: &str,
) -> BackupResult<T> {
    let data = entries
        .get(name)
        .ok_or_else(|| BackupError::Format(format!("missing entry {name}")))?;
    Ok(serde_json::from_slice(data)?)
}

/// Read an archive back into a [`ClusterState`].
pub fn read_archive(uri: &BackupUri) -> BackupResult<(BackupManifest, ClusterState)> {
    let entries = read_entries(uri)?;
    let manifest: BackupManifest = take(&entries, MANIFEST)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(BackupError::Format(format!(
            "unsupported format version {}",
            manifest.format_version
        )));
    }
    let state = ClusterState {
        version: manifest.state_version,
        apps: take(&entries, APPS)?,
        pods: take(&entries, PODS)?,
        deployments: take(&entries, DEPLOYMENTS)?,
        tasks: take(&entries, TASKS)?,
    };
    if state.apps.len() != manifest.apps || state.pods.len() != manifest.pods {
        return Err(BackupError::Format(
            "entry contents disagree with manifest".to_string(),
        ));
    }
    Ok((manifest, state))
}

/// Check that an archive is readable and complete.
pub fn verify(uri: &BackupUri) -> BackupResult<BackupSummary> {
    let entries = read_entries(uri)?.len();
    if entries == 0 {
        return Err(BackupError::Format("archive has no entries".to_string()));
    }
    let (manifest, _) = read_archive(uri)?;
    Ok(BackupSummary {
        uri: uri.to_string(),
        entries,
        manifest,
    })
}
