//! convoy-engine: deployment engine, reconciler and leader coordinator.
//!
//! # Architecture
//!
//! - [`DeploymentEngine`] validates spec changes, persists desired state
//!   together with a [`DeploymentRecord`](convoy_state::DeploymentRecord),
//!   and drives each record's steps against a [`ResourceManager`].
//! - [`Reconciler`] compares persisted tasks with the resource manager's
//!   report after a leadership change and opens corrective deployments.
//! - [`Coordinator`] sequences restore, reconcile and resume when this
//!   replica is elected, and handles abdication with backup and restore.
//!
//! Every write goes through the store with the election's current fence.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod plan;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod retry;
pub mod secrets;
pub mod validation;

pub use config::{AgentConfig, DeploymentConfig, SecretsConfig};
pub use coordinator::{Coordinator, CoordinatorError};
pub use engine::{DeploymentEngine, SpecChange};
pub use error::{EngineError, EngineResult, FieldError, ValidationError};
pub use reconciler::{ReconcileReport, Reconciler};
pub use resources::{LocalResourceManager, ResourceError, ResourceManager};
pub use retry::{RetryError, RetryPolicy};
pub use secrets::{NamespaceSecretStore, SecretStore};
