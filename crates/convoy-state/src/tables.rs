//! redb table definitions for the Convoy state store.
//!
//! String-keyed tables hold JSON-serialized domain types. Task keys are
//! `{spec_id}:{task_id}` so all tasks of a spec share a prefix.

use redb::TableDefinition;

/// App specs keyed by path id (`/group/app`).
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Pod specs keyed by path id.
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// In-flight deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Terminal deployment records keyed by deployment id.
pub const DEPLOYMENT_ARCHIVE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("deployment_archive");

/// Task records keyed by `{spec_id}:{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// The leader lease, a single row under [`LEASE_KEY`].
pub const LEADER: TableDefinition<&str, &[u8]> = TableDefinition::new("leader");

/// Counters and hand-off markers.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Event log keyed by sequence number.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

pub const LEASE_KEY: &str = "leader";

/// Store-wide counter for spec versions and deployment sequences.
pub const STATE_VERSION_KEY: &str = "state_version";

/// Highest leader epoch ever granted.
pub const LEADER_EPOCH_KEY: &str = "leader_epoch";

/// Highest event sequence ever assigned.
pub const EVENT_SEQ_KEY: &str = "event_seq";

/// Backup URI to restore from on the next leader acquisition.
pub const PENDING_RESTORE_KEY: &str = "pending_restore";
