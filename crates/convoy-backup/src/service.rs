//! Backup and restore against the live store.

use tracing::info;

use convoy_state::{ClusterState, Fence, StateStore};

use crate::archive::{self, BackupSummary};
use crate::error::BackupResult;
use crate::uri::BackupUri;

#[derive(Clone)]
pub struct BackupService {
    store: StateStore,
}

impl BackupService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Serialize a single-transaction snapshot of the store to `uri`.
    pub fn backup(&self, uri: &str) -> BackupResult<BackupSummary> {
        let uri = BackupUri::parse(uri)?;
        let state = self.store.snapshot()?;
        let summary = archive::write_archive(&uri, &state)?;
        info!(
            %uri,
            apps = summary.manifest.apps,
            pods = summary.manifest.pods,
            deployments = summary.manifest.deployments,
            "backup written"
        );
        Ok(summary)
    }

    /// Replace the store's cluster state with the archive at `uri`. The
    /// write is fenced, so only the current leader can restore.
    pub fn restore(&self, fence: &Fence, uri: &str) -> BackupResult<ClusterState> {
        let uri = BackupUri::parse(uri)?;
        let (manifest, state) = archive::read_archive(&uri)?;
        self.store
            .write(Some(fence), |txn| txn.replace_cluster_state(&state))?;
        info!(
            %uri,
            created_at = %manifest.created_at,
            apps = manifest.apps,
            pods = manifest.pods,
            "state restored from backup"
        );
        Ok(state)
    }

    pub fn verify(&self, uri: &str) -> BackupResult<BackupSummary> {
        archive::verify(&BackupUri::parse(uri)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_state::{LeaderLease, PathId, RunSpec, SpecKind};

    fn leader_store() -> (StateStore, Fence) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(None, |txn| {
                txn.put_lease(&LeaderLease {
                    holder: "r1".to_string(),
                    address: "127.0.0.1:8080".to_string(),
                    epoch: 1,
                    acquired_at_ms: 0,
                    renewed_at_ms: 0,
                    expires_at_ms: u64::MAX,
                })
            })
            .unwrap();
        let fence = Fence {
            holder: "r1".to_string(),
            epoch: 1,
            now_ms: 1,
        };
        (store, fence)
    }

    fn put_app(store: &StateStore, fence: &Fence, id: &str) {
        let mut spec = RunSpec::App(
            serde_json::from_value(serde_json::json!({ "id": id, "cmd": "sleep 10" })).unwrap(),
        );
        store
            .write(Some(fence), |txn| {
                spec.set_version(txn.next_version()?);
                txn.put_spec(&spec)
            })
            .unwrap();
    }

    fn file_uri(dir: &tempfile::TempDir, name: &str) -> String {
        url::Url::from_file_path(dir.path().join(name))
            .unwrap()
            .to_string()
    }

    #[test]
    fn backup_then_restore_is_observationally_identical() {
        let dir = tempfile::tempdir().unwrap();
        let uri = file_uri(&dir, "backup.tar");
        let (store, fence) = leader_store();
        put_app(&store, &fence, "/sleep");
        let service = BackupService::new(store.clone());

        service.backup(&uri).unwrap();
        let before = store.snapshot().unwrap();

        put_app(&store, &fence, "/extra");
        service.restore(&fence, &uri).unwrap();

        let after = store.snapshot().unwrap();
        assert_eq!(after.apps, before.apps);
        assert!(after.version >= before.version);
    }

    #[test]
    fn deleted_spec_is_not_resurrected() {
        let dir = tempfile::tempdir().unwrap();
        let uri = file_uri(&dir, "backup.tar.gz");
        let (store, fence) = leader_store();
        put_app(&store, &fence, "/gone");
        let id = PathId::parse("/gone").unwrap();
        store
            .write(Some(&fence), |txn| txn.delete_spec(SpecKind::App, &id))
            .unwrap();

        let service = BackupService::new(store.clone());
        assert!(service.backup(&uri).unwrap().entries > 0);
        service.restore(&fence, &uri).unwrap();
        assert!(store.get_spec(SpecKind::App, &id).unwrap().is_none());
    }

    #[test]
    fn restore_requires_current_fence() {
        let dir = tempfile::tempdir().unwrap();
        let uri = file_uri(&dir, "backup.tar");
        let (store, fence) = leader_store();
        put_app(&store, &fence, "/sleep");
        let service = BackupService::new(store.clone());
        service.backup(&uri).unwrap();

        let stale = Fence { epoch: 0, ..fence };
        let err = service.restore(&stale, &uri).unwrap_err();
        assert!(matches!(err, crate::BackupError::State(e) if e.is_fenced()));
    }
}
