//! Desired-state documents and task records.
//!
//! App and pod specs are immutable once stored: an update writes a new
//! document with a higher [`SpecVersion`]. JSON field names follow the
//! camelCase convention of the HTTP API so documents round-trip unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version assigned to a spec when it is accepted. Zero means unassigned.
pub type SpecVersion = u64;

/// Unique identifier for a task launched by the resource manager.
pub type TaskId = String;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([a-z0-9]|[a-z0-9][a-z0-9\-]*[a-z0-9])\.)*([a-z0-9]|[a-z0-9][a-z0-9\-]*[a-z0-9])$")
        .expect("static regex")
});

/// Rejected path identifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid id '{0}': segments must be lowercase letters, digits, '-' or '.'")]
pub struct InvalidPathId(pub String);

// ── Path identifiers ──────────────────────────────────────────────

/// Path-like identifier of an app or pod, always absolute (`/group/app`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathId(String);

impl PathId {
    /// Parse and normalize an id. A missing leading `/` is added and a
    /// trailing `/` is dropped.
    pub fn parse(raw: &str) -> Result<Self, InvalidPathId> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(InvalidPathId(raw.to_string()));
        }
        for segment in trimmed.split('/') {
            if !SEGMENT.is_match(segment) {
                return Err(InvalidPathId(raw.to_string()));
            }
        }
        Ok(Self(format!("/{trimmed}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The enclosing group, `/` for top-level ids.
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.0[..idx],
        }
    }

    /// Flattened form used as a task id prefix (`/group/app` → `group_app`).
    pub fn safe_name(&self) -> String {
        self.0.trim_start_matches('/').replace('/', "_")
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PathId {
    type Error = InvalidPathId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathId> for String {
    fn from(id: PathId) -> Self {
        id.0
    }
}

// ── Shared fragments ──────────────────────────────────────────────

/// Environment value: a literal or a reference to a declared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Plain(String),
    Secret { secret: String },
}

/// A declared secret, resolved from the secret store by `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub source: String,
}

fn default_instances() -> u32 {
    1
}

fn default_cpus() -> f64 {
    1.0
}

fn default_mem() -> f64 {
    128.0
}

fn default_protocol() -> String {
    "tcp".to_string()
}

// ── App ───────────────────────────────────────────────────────────

/// Desired state of a single-container application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub id: PathId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_mem")]
    pub mem: f64,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<AppContainer>,
    #[serde(default)]
    pub port_definitions: Vec<PortDefinition>,
    #[serde(default)]
    pub accepted_resource_roles: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub version: SpecVersion,
    /// Version of the last change that was not only a scale.
    #[serde(default)]
    pub config_version: SpecVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppContainer {
    #[serde(rename = "type", default = "AppContainer::default_type")]
    pub kind: String,
    #[serde(default)]
    pub volumes: Vec<AppVolume>,
}

impl AppContainer {
    fn default_type() -> String {
        "MESOS".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppVolume {
    pub container_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

// ── Pod ───────────────────────────────────────────────────────────

/// Desired state of a group of co-located containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub id: PathId,
    pub containers: Vec<PodContainer>,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
    #[serde(default)]
    pub networks: Vec<PodNetwork>,
    #[serde(default)]
    pub scaling: PodScaling,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub version: SpecVersion,
    #[serde(default)]
    pub config_version: SpecVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodContainer {
    pub name: String,
    pub resources: PodResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<PodExec>,
    #[serde(default)]
    pub endpoints: Vec<PodEndpoint>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodResources {
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_mem")]
    pub mem: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodExec {
    pub command: PodCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCommand {
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEndpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodNetwork {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodScaling {
    #[serde(default = "default_instances")]
    pub instances: u32,
}

impl Default for PodScaling {
    fn default() -> Self {
        Self { instances: 1 }
    }
}

// ── RunSpec ───────────────────────────────────────────────────────

/// Whether a spec describes an app or a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecKind {
    App,
    Pod,
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecKind::App => f.write_str("app"),
            SpecKind::Pod => f.write_str("pod"),
        }
    }
}

/// Either kind of desired-state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSpec {
    App(AppSpec),
    Pod(PodSpec),
}

impl RunSpec {
    pub fn id(&self) -> &PathId {
        match self {
            RunSpec::App(app) => &app.id,
            RunSpec::Pod(pod) => &pod.id,
        }
    }

    pub fn kind(&self) -> SpecKind {
        match self {
            RunSpec::App(_) => SpecKind::App,
            RunSpec::Pod(_) => SpecKind::Pod,
        }
    }

    pub fn version(&self) -> SpecVersion {
        match self {
            RunSpec::App(app) => app.version,
            RunSpec::Pod(pod) => pod.version,
        }
    }

    pub fn set_version(&mut self, version: SpecVersion) {
        match self {
            RunSpec::App(app) => app.version = version,
            RunSpec::Pod(pod) => pod.version = version,
        }
    }

    /// Version tasks must carry to count as current. Scaling leaves it
    /// unchanged; a document without one falls back to its own version.
    pub fn config_version(&self) -> SpecVersion {
        let config = match self {
            RunSpec::App(app) => app.config_version,
            RunSpec::Pod(pod) => pod.config_version,
        };
        if config == 0 { self.version() } else { config }
    }

    fn set_config_version(&mut self, version: SpecVersion) {
        match self {
            RunSpec::App(app) => app.config_version = version,
            RunSpec::Pod(pod) => pod.config_version = version,
        }
    }

    /// Stamp an accepted document with `version`. The config version is
    /// carried over from `previous` when this document only rescales it.
    pub fn assign_version(&mut self, version: SpecVersion, previous: Option<&RunSpec>) {
        self.set_version(version);
        let config = match previous {
            Some(previous) if self.is_scale_of(previous) => previous.config_version(),
            _ => version,
        };
        self.set_config_version(config);
    }

    /// Desired number of running instances.
    pub fn instances(&self) -> u32 {
        match self {
            RunSpec::App(app) => app.instances,
            RunSpec::Pod(pod) => pod.scaling.instances,
        }
    }

    pub fn secrets(&self) -> &BTreeMap<String, SecretRef> {
        match self {
            RunSpec::App(app) => &app.secrets,
            RunSpec::Pod(pod) => &pod.secrets,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, EnvValue> {
        match self {
            RunSpec::App(app) => &app.env,
            RunSpec::Pod(pod) => &pod.environment,
        }
    }

    /// Roles an agent must carry to host this spec. Empty means any.
    pub fn accepted_roles(&self) -> &[String] {
        match self {
            RunSpec::App(app) => &app.accepted_resource_roles,
            RunSpec::Pod(_) => &[],
        }
    }

    /// Whether `other` differs from `self` only in instance count and versions.
    pub fn is_scale_of(&self, other: &RunSpec) -> bool {
        match (self, other) {
            (RunSpec::App(a), RunSpec::App(b)) => {
                let mut b = b.clone();
                b.instances = a.instances;
                b.version = a.version;
                b.config_version = a.config_version;
                *a == b
            }
            (RunSpec::Pod(a), RunSpec::Pod(b)) => {
                let mut b = b.clone();
                b.scaling = a.scaling.clone();
                b.version = a.version;
                b.config_version = a.config_version;
                *a == b
            }
            _ => false,
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// Task status as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    TaskStaging,
    TaskRunning,
    TaskKilled,
    TaskFailed,
    TaskLost,
}

impl TaskStatus {
    /// Staging or running: the task still counts against the spec.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::TaskStaging | TaskStatus::TaskRunning)
    }
}

/// A task launched on behalf of a spec, as last persisted by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub spec_id: PathId,
    pub kind: SpecKind,
    /// Config version of the spec the task was launched for.
    pub version: SpecVersion,
    pub host: String,
    pub status: TaskStatus,
    /// Unix timestamp (milliseconds) when the task was launched.
    pub started_at: u64,
}

impl TaskRecord {
    /// Build the composite key for the tasks table.
    pub fn table_key(&self) -> String {
        task_key(&self.spec_id, &self.id)
    }
}

/// Composite tasks-table key.
pub fn task_key(spec_id: &PathId, task_id: &str) -> String {
    format!("{spec_id}:{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_id_normalizes() {
        assert_eq!(PathId::parse("sleep").unwrap().as_str(), "/sleep");
        assert_eq!(PathId::parse("/group/app/").unwrap().as_str(), "/group/app");
        assert_eq!(PathId::parse("/a.b-c").unwrap().as_str(), "/a.b-c");
    }

    #[test]
    fn path_id_rejects_bad_segments() {
        assert!(PathId::parse("").is_err());
        assert!(PathId::parse("/").is_err());
        assert!(PathId::parse("/Upper").is_err());
        assert!(PathId::parse("/a//b").is_err());
        assert!(PathId::parse("/-lead").is_err());
        assert!(PathId::parse("/under_score").is_err());
    }

    #[test]
    fn path_id_parent() {
        assert_eq!(PathId::parse("/sleep").unwrap().parent(), "/");
        assert_eq!(PathId::parse("/some/secret").unwrap().parent(), "/some");
        assert_eq!(PathId::parse("/a/b/c").unwrap().safe_name(), "a_b_c");
    }

    #[test]
    fn app_json_defaults_and_env_forms() {
        let app: AppSpec = serde_json::from_value(serde_json::json!({
            "id": "/app-secret",
            "cmd": "sleep 1000",
            "env": {
                "PLAIN": "value",
                "SECRET_ENV": { "secret": "secret1" }
            },
            "secrets": { "secret1": { "source": "/mysecret" } },
            "portDefinitions": [{ "port": 0, "name": "api" }]
        }))
        .unwrap();

        assert_eq!(app.instances, 1);
        assert_eq!(app.env["PLAIN"], EnvValue::Plain("value".to_string()));
        assert_eq!(
            app.env["SECRET_ENV"],
            EnvValue::Secret {
                secret: "secret1".to_string()
            }
        );
        assert_eq!(app.port_definitions[0].protocol, "tcp");
        assert_eq!(app.version, 0);
    }

    #[test]
    fn pod_json_uses_camel_case() {
        let pod: PodSpec = serde_json::from_value(serde_json::json!({
            "id": "/pod-a",
            "containers": [{
                "name": "container-1",
                "resources": { "cpus": 0.1, "mem": 64 },
                "exec": { "command": { "shell": "sleep 100" } },
                "volumeMounts": [{ "name": "vol", "mountPath": "./secret" }]
            }],
            "volumes": [{ "name": "vol", "secret": "secret1" }],
            "networks": [{ "mode": "host" }]
        }))
        .unwrap();

        assert_eq!(pod.scaling.instances, 1);
        assert_eq!(pod.containers[0].volume_mounts[0].mount_path, "./secret");
        assert_eq!(pod.volumes[0].secret.as_deref(), Some("secret1"));
    }

    #[test]
    fn scale_detection_ignores_version_and_instances() {
        let app: AppSpec =
            serde_json::from_value(serde_json::json!({ "id": "/a", "cmd": "sleep 1" })).unwrap();
        let old = RunSpec::App(app.clone());

        let mut scaled = app.clone();
        scaled.instances = 5;
        scaled.version = 9;
        assert!(old.is_scale_of(&RunSpec::App(scaled)));

        let mut changed = app;
        changed.cmd = Some("sleep 2".to_string());
        assert!(!old.is_scale_of(&RunSpec::App(changed)));
    }

    #[test]
    fn scaling_keeps_the_config_version() {
        let app: AppSpec =
            serde_json::from_value(serde_json::json!({ "id": "/a", "cmd": "sleep 1" })).unwrap();
        let mut created = RunSpec::App(app.clone());
        created.assign_version(2, None);
        assert_eq!(created.config_version(), 2);

        let mut scaled = app.clone();
        scaled.instances = 4;
        let mut scaled = RunSpec::App(scaled);
        scaled.assign_version(5, Some(&created));
        assert_eq!(scaled.version(), 5);
        assert_eq!(scaled.config_version(), 2);

        // Resubmitting the same document is a scale to the same count.
        let mut same = RunSpec::App(app.clone());
        same.assign_version(6, Some(&created));
        assert_eq!(same.config_version(), 2);

        let mut changed = app;
        changed.cmd = Some("sleep 2".to_string());
        let mut changed = RunSpec::App(changed);
        changed.assign_version(7, Some(&scaled));
        assert_eq!(changed.config_version(), 7);
    }

    #[test]
    fn task_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::TaskRunning).unwrap();
        assert_eq!(json, "\"TASK_RUNNING\"");
    }
}
