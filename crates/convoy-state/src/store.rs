//! StateStore: redb-backed persistence for Convoy.
//!
//! Reads open their own read transaction. Every mutation goes through
//! [`StateStore::write`], which runs a closure against a [`StateTxn`] inside
//! a single redb write transaction, optionally guarded by a leader
//! [`Fence`]. Events appended inside the closure become visible to readers
//! at the same commit as the state they describe.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cluster::ClusterState;
use crate::deployment::DeploymentRecord;
use crate::error::{StateError, StateResult};
use crate::event::{Event, EventRecord};
use crate::lease::{Fence, LeaderLease};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(map_err!(Deserialize)),
        None => Ok(None),
    }
}

fn list_json<T, R>(table: &R, prefix: Option<&str>) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if prefix.is_some_and(|p| !key.value().starts_with(p)) {
            continue;
        }
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

fn get_counter<R>(table: &R, key: &str) -> StateResult<u64>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(get_json::<u64, _>(table, key)?.unwrap_or(0))
}

fn spec_table(kind: SpecKind) -> redb::TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        SpecKind::App => APPS,
        SpecKind::Pod => PODS,
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Highest committed event sequence.
    events: Arc<watch::Sender<u64>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::init(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn init(db: Database) -> StateResult<Self> {
        let db = Arc::new(db);
        ensure_tables(&db)?;
        let last_seq = {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            get_counter(&meta, EVENT_SEQ_KEY)?
        };
        let (tx, _) = watch::channel(last_seq);
        Ok(Self {
            db,
            events: Arc::new(tx),
        })
    }

    /// Run `f` inside one write transaction.
    ///
    /// With a fence, the stored lease is checked first and the write is
    /// refused with [`StateError::Fenced`] unless the fence still admits it.
    /// The transaction is committed only if `f` succeeds.
    pub fn write<T, E, F>(&self, fence: Option<&Fence>, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StateTxn<'_>) -> Result<T, E>,
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut scope = StateTxn {
            txn: &txn,
            last_event: None,
        };
        let outcome = match fence {
            Some(fence) => match scope.check_fence(fence) {
                Ok(()) => f(&mut scope),
                Err(e) => Err(e.into()),
            },
            None => f(&mut scope),
        };
        let last_event = scope.last_event;

        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                if let Some(seq) = last_event {
                    self.events.send_replace(seq);
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = txn.abort() {
                    warn!(error = %e, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }

    // ── Specs ──────────────────────────────────────────────────────

    pub fn get_spec(&self, kind: SpecKind, id: &PathId) -> StateResult<Option<RunSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(spec_table(kind)).map_err(map_err!(Table))?;
        Ok(match kind {
            SpecKind::App => get_json::<AppSpec, _>(&table, id.as_str())?.map(RunSpec::App),
            SpecKind::Pod => get_json::<PodSpec, _>(&table, id.as_str())?.map(RunSpec::Pod),
        })
    }

    pub fn list_apps(&self) -> StateResult<Vec<AppSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        list_json(&table, None)
    }

    pub fn list_pods(&self) -> StateResult<Vec<PodSpec>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        list_json(&table, None)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Look up a deployment, in-flight first, then the archive.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let live = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        if let Some(record) = get_json(&live, id)? {
            return Ok(Some(record));
        }
        let archive = txn
            .open_table(DEPLOYMENT_ARCHIVE)
            .map_err(map_err!(Table))?;
        get_json(&archive, id)
    }

    /// In-flight deployments ordered by creation sequence.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut records: Vec<DeploymentRecord> = list_json(&table, None)?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Archived deployments ordered by creation sequence.
    pub fn list_archived_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(DEPLOYMENT_ARCHIVE)
            .map_err(map_err!(Table))?;
        let mut records: Vec<DeploymentRecord> = list_json(&table, None)?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        list_json(&table, None)
    }

    pub fn tasks_for(&self, spec_id: &PathId) -> StateResult<Vec<TaskRecord>> {
        let prefix = format!("{spec_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        list_json(&table, Some(&prefix))
    }

    // ── Leadership and metadata ────────────────────────────────────

    pub fn lease(&self) -> StateResult<Option<LeaderLease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEADER).map_err(map_err!(Table))?;
        get_json(&table, LEASE_KEY)
    }

    pub fn state_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        get_counter(&meta, STATE_VERSION_KEY)
    }

    pub fn pending_restore(&self) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        get_json(&meta, PENDING_RESTORE_KEY)
    }

    /// Read apps, pods, in-flight deployments and tasks in one transaction.
    pub fn snapshot(&self) -> StateResult<ClusterState> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        let pods = txn.open_table(PODS).map_err(map_err!(Table))?;
        let deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;

        let mut deployments: Vec<DeploymentRecord> = list_json(&deployments, None)?;
        deployments.sort_by_key(|r| r.sequence);
        Ok(ClusterState {
            version: get_counter(&meta, STATE_VERSION_KEY)?,
            apps: list_json(&apps, None)?,
            pods: list_json(&pods, None)?,
            deployments,
            tasks: list_json(&tasks, None)?,
        })
    }

    // ── Event log ──────────────────────────────────────────────────

    /// Highest committed event sequence, zero if none.
    pub fn last_event_seq(&self) -> u64 {
        *self.events.borrow()
    }

    /// Receiver that changes whenever new events are committed.
    pub fn watch_events(&self) -> watch::Receiver<u64> {
        self.events.subscribe()
    }

    /// Up to `limit` persisted events with a sequence greater than `after`.
    pub fn events_after(&self, after: u64, limit: usize) -> StateResult<Vec<EventRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(after.saturating_add(1)..)
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    /// Drop all but the newest `retain` events. Returns the number removed.
    pub fn prune_events(&self, retain: u64) -> StateResult<usize> {
        let last = self.last_event_seq();
        let cutoff = last.saturating_sub(retain);
        if cutoff == 0 {
            return Ok(0);
        }
        self.write(None, |txn| txn.remove_events_through(cutoff))
    }
}

fn ensure_tables(db: &Database) -> StateResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    // Opening a table in a write transaction creates it if absent.
    txn.open_table(APPS).map_err(map_err!(Table))?;
    txn.open_table(PODS).map_err(map_err!(Table))?;
    txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
    txn.open_table(DEPLOYMENT_ARCHIVE)
        .map_err(map_err!(Table))?;
    txn.open_table(TASKS).map_err(map_err!(Table))?;
    txn.open_table(LEADER).map_err(map_err!(Table))?;
    txn.open_table(META).map_err(map_err!(Table))?;
    txn.open_table(EVENTS).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

/// Mutation handle passed to [`StateStore::write`] closures.
pub struct StateTxn<'a> {
    txn: &'a WriteTransaction,
    last_event: Option<u64>,
}

impl StateTxn<'_> {
    fn check_fence(&self, fence: &Fence) -> StateResult<()> {
        match self.lease()? {
            Some(lease) if fence.admits(&lease) => Ok(()),
            Some(lease) => {
                debug!(
                    holder = %lease.holder,
                    epoch = lease.epoch,
                    fence_holder = %fence.holder,
                    fence_epoch = fence.epoch,
                    "fenced write rejected"
                );
                Err(StateError::Fenced(format!(
                    "lease held by {} at epoch {}",
                    lease.holder, lease.epoch
                )))
            }
            None => Err(StateError::Fenced("no leader lease".to_string())),
        }
    }

    fn put_raw(
        &self,
        table: redb::TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        value: &[u8],
    ) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table.insert(key, value).map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove_raw(
        &self,
        table: redb::TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn clear(
        &self,
        table: redb::TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StateResult<()> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let keys: Vec<String> = table
            .iter()
            .map_err(map_err!(Read))?
            .map(|entry| entry.map(|(k, _)| k.value().to_string()))
            .collect::<Result<_, _>>()
            .map_err(map_err!(Read))?;
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(())
    }

    fn meta_counter(&self, key: &str) -> StateResult<u64> {
        let meta = self.txn.open_table(META).map_err(map_err!(Table))?;
        get_counter(&meta, key)
    }

    fn set_meta_counter(&self, key: &str, value: u64) -> StateResult<()> {
        self.put_raw(META, key, &encode(&value)?)
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Advance the store-wide version counter and return the new value.
    pub fn next_version(&self) -> StateResult<u64> {
        let next = self.meta_counter(STATE_VERSION_KEY)? + 1;
        self.set_meta_counter(STATE_VERSION_KEY, next)?;
        Ok(next)
    }

    // ── Specs ──────────────────────────────────────────────────────

    pub fn get_spec(&self, kind: SpecKind, id: &PathId) -> StateResult<Option<RunSpec>> {
        let table = self
            .txn
            .open_table(spec_table(kind))
            .map_err(map_err!(Table))?;
        Ok(match kind {
            SpecKind::App => get_json::<AppSpec, _>(&table, id.as_str())?.map(RunSpec::App),
            SpecKind::Pod => get_json::<PodSpec, _>(&table, id.as_str())?.map(RunSpec::Pod),
        })
    }

    pub fn put_spec(&self, spec: &RunSpec) -> StateResult<()> {
        let value = match spec {
            RunSpec::App(app) => encode(app)?,
            RunSpec::Pod(pod) => encode(pod)?,
        };
        self.put_raw(spec_table(spec.kind()), spec.id().as_str(), &value)?;
        debug!(id = %spec.id(), version = spec.version(), "spec stored");
        Ok(())
    }

    pub fn delete_spec(&self, kind: SpecKind, id: &PathId) -> StateResult<bool> {
        self.remove_raw(spec_table(kind), id.as_str())
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<DeploymentRecord>> {
        let table = self.txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        get_json(&table, id)
    }

    /// In-flight deployments ordered by creation sequence.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let table = self.txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut records: Vec<DeploymentRecord> = list_json(&table, None)?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put_raw(DEPLOYMENTS, &record.id, &encode(record)?)
    }

    /// Move a terminal deployment to the archive, keeping at most `limit`
    /// archived records (oldest dropped first).
    pub fn archive_deployment(&self, record: &DeploymentRecord, limit: usize) -> StateResult<()> {
        self.remove_raw(DEPLOYMENTS, &record.id)?;
        let mut archive = self
            .txn
            .open_table(DEPLOYMENT_ARCHIVE)
            .map_err(map_err!(Table))?;
        archive
            .insert(record.id.as_str(), encode(record)?.as_slice())
            .map_err(map_err!(Write))?;

        let mut archived: Vec<DeploymentRecord> = list_json(&archive, None)?;
        if archived.len() > limit {
            archived.sort_by_key(|r| r.sequence);
            let excess = archived.len() - limit;
            for old in &archived[..excess] {
                archive.remove(old.id.as_str()).map_err(map_err!(Write))?;
            }
        }
        debug!(deployment = %record.id, status = ?record.status, "deployment archived");
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn put_task(&self, task: &TaskRecord) -> StateResult<()> {
        self.put_raw(TASKS, &task.table_key(), &encode(task)?)
    }

    pub fn delete_task(&self, spec_id: &PathId, task_id: &str) -> StateResult<bool> {
        self.remove_raw(TASKS, &task_key(spec_id, task_id))
    }

    pub fn tasks_for(&self, spec_id: &PathId) -> StateResult<Vec<TaskRecord>> {
        let prefix = format!("{spec_id}:");
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        list_json(&table, Some(&prefix))
    }

    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        list_json(&table, None)
    }

    // ── Leadership and metadata ────────────────────────────────────

    pub fn lease(&self) -> StateResult<Option<LeaderLease>> {
        let table = self.txn.open_table(LEADER).map_err(map_err!(Table))?;
        get_json(&table, LEASE_KEY)
    }

    pub fn put_lease(&self, lease: &LeaderLease) -> StateResult<()> {
        self.put_raw(LEADER, LEASE_KEY, &encode(lease)?)
    }

    pub fn delete_lease(&self) -> StateResult<bool> {
        self.remove_raw(LEADER, LEASE_KEY)
    }

    /// Advance the leader epoch counter and return the new epoch.
    pub fn next_epoch(&self) -> StateResult<u64> {
        let next = self.meta_counter(LEADER_EPOCH_KEY)? + 1;
        self.set_meta_counter(LEADER_EPOCH_KEY, next)?;
        Ok(next)
    }

    pub fn pending_restore(&self) -> StateResult<Option<String>> {
        let meta = self.txn.open_table(META).map_err(map_err!(Table))?;
        get_json(&meta, PENDING_RESTORE_KEY)
    }

    pub fn set_pending_restore(&self, uri: Option<&str>) -> StateResult<()> {
        match uri {
            Some(uri) => self.put_raw(META, PENDING_RESTORE_KEY, &encode(&uri)?),
            None => self.remove_raw(META, PENDING_RESTORE_KEY).map(|_| ()),
        }
    }

    /// Replace apps, pods, in-flight deployments and tasks with `state`.
    ///
    /// The version counter never moves backwards, so versions assigned
    /// after a restore stay above every version seen before it.
    pub fn replace_cluster_state(&self, state: &ClusterState) -> StateResult<()> {
        self.clear(APPS)?;
        self.clear(PODS)?;
        self.clear(DEPLOYMENTS)?;
        self.clear(TASKS)?;

        for app in &state.apps {
            self.put_raw(APPS, app.id.as_str(), &encode(app)?)?;
        }
        for pod in &state.pods {
            self.put_raw(PODS, pod.id.as_str(), &encode(pod)?)?;
        }
        for record in &state.deployments {
            self.put_deployment(record)?;
        }
        for task in &state.tasks {
            self.put_task(task)?;
        }

        let current = self.meta_counter(STATE_VERSION_KEY)?;
        self.set_meta_counter(STATE_VERSION_KEY, current.max(state.version))?;
        debug!(
            apps = state.apps.len(),
            pods = state.pods.len(),
            deployments = state.deployments.len(),
            tasks = state.tasks.len(),
            "cluster state replaced"
        );
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────────

    /// Append an event to the log and return its sequence number.
    pub fn append(&mut self, event: Event) -> StateResult<u64> {
        let seq = self.meta_counter(EVENT_SEQ_KEY)? + 1;
        self.set_meta_counter(EVENT_SEQ_KEY, seq)?;
        let record = EventRecord::now(seq, event);
        let mut table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        table
            .insert(seq, encode(&record)?.as_slice())
            .map_err(map_err!(Write))?;
        self.last_event = Some(seq);
        Ok(seq)
    }

    fn remove_events_through(&self, cutoff: u64) -> StateResult<usize> {
        let mut table = self.txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let keys: Vec<u64> = table
            .range(..=cutoff)
            .map_err(map_err!(Read))?
            .map(|entry| entry.map(|(k, _)| k.value()))
            .collect::<Result<_, _>>()
            .map_err(map_err!(Read))?;
        for key in &keys {
            table.remove(*key).map_err(map_err!(Write))?;
        }
        Ok(keys.len())
    }
}
