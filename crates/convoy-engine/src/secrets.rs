//! Secret store collaborator.

use tracing::debug;

use crate::config::SecretsConfig;

/// Answers whether a secret source may be referenced by a spec.
pub trait SecretStore: Send + Sync {
    fn is_accessible(&self, source: &str) -> bool;
}

/// Grants access by namespace: `/team/db-password` is accessible when
/// `/team` is one of the configured namespaces. Top-level secrets live
/// in `/`.
#[derive(Debug, Clone)]
pub struct NamespaceSecretStore {
    namespaces: Vec<String>,
}

impl NamespaceSecretStore {
    pub fn new(config: &SecretsConfig) -> Self {
        let namespaces = config
            .accessible_namespaces
            .iter()
            .map(|ns| normalize(ns))
            .collect();
        Self { namespaces }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn namespace_of(source: &str) -> String {
    let path = normalize(source);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

impl SecretStore for NamespaceSecretStore {
    fn is_accessible(&self, source: &str) -> bool {
        let namespace = namespace_of(source);
        let accessible = self.namespaces.iter().any(|ns| *ns == namespace);
        if !accessible {
            debug!(%source, %namespace, "secret outside accessible namespaces");
        }
        accessible
    }
}
