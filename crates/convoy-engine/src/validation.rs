//! Spec validation. Runs before anything is written.

use std::collections::{BTreeMap, BTreeSet};

use convoy_state::{AppSpec, EnvValue, PodSpec, RunSpec, SecretRef};

use crate::error::{FieldError, ValidationError};
use crate::secrets::SecretStore;

#[derive(Default)]
struct Report {
    fields: BTreeMap<String, Vec<String>>,
}

impl Report {
    fn add(&mut self, path: impl Into<String>, error: impl Into<String>) {
        self.fields.entry(path.into()).or_default().push(error.into());
    }

    fn finish(self) -> Result<(), ValidationError> {
        if self.fields.is_empty() {
            return Ok(());
        }
        Err(ValidationError::new(
            self.fields
                .into_iter()
                .map(|(path, errors)| FieldError { path, errors })
                .collect(),
        ))
    }
}

/// Check `spec` against the structural rules, the instance limit and the
/// secret store. Every violation is reported, not only the first.
pub fn validate(
    spec: &RunSpec,
    secrets: &dyn SecretStore,
    max_instances: u32,
) -> Result<(), ValidationError> {
    let mut report = Report::default();
    match spec {
        RunSpec::App(app) => check_app(app, &mut report),
        RunSpec::Pod(pod) => check_pod(pod, &mut report),
    }
    if spec.instances() > max_instances {
        let path = match spec {
            RunSpec::App(_) => "/instances",
            RunSpec::Pod(_) => "/scaling/instances",
        };
        report.add(path, format!("must not exceed {max_instances}"));
    }
    check_env(spec.env(), spec.secrets(), env_path(spec), &mut report);
    check_secret_access(spec.secrets(), secrets, &mut report);
    report.finish()
}

fn env_path(spec: &RunSpec) -> &'static str {
    match spec {
        RunSpec::App(_) => "/env",
        RunSpec::Pod(_) => "/environment",
    }
}

fn check_resources(path: &str, cpus: f64, mem: f64, report: &mut Report) {
    if cpus.is_nan() || cpus <= 0.0 {
        report.add(format!("{path}/cpus"), "must be greater than 0");
    }
    if mem.is_nan() || mem <= 0.0 {
        report.add(format!("{path}/mem"), "must be greater than 0");
    }
}

fn check_app(app: &AppSpec, report: &mut Report) {
    check_resources("", app.cpus, app.mem, report);
    if let Some(container) = &app.container {
        for (idx, volume) in container.volumes.iter().enumerate() {
            if let Some(secret) = &volume.secret {
                if !app.secrets.contains_key(secret) {
                    report.add(
                        format!("/container/volumes({idx})/secret"),
                        format!("references undeclared secret '{secret}'"),
                    );
                }
            }
        }
    }
}

fn check_pod(pod: &PodSpec, report: &mut Report) {
    if pod.containers.is_empty() {
        report.add("/containers", "must not be empty");
    }

    let mut names = BTreeSet::new();
    let volumes: BTreeSet<&str> = pod.volumes.iter().map(|v| v.name.as_str()).collect();
    for (idx, container) in pod.containers.iter().enumerate() {
        let path = format!("/containers({idx})");
        if container.name.trim().is_empty() {
            report.add(format!("{path}/name"), "must not be empty");
        } else if !names.insert(container.name.as_str()) {
            report.add(
                format!("{path}/name"),
                format!("duplicate container name '{}'", container.name),
            );
        }
        check_resources(
            &format!("{path}/resources"),
            container.resources.cpus,
            container.resources.mem,
            report,
        );
        for (m, mount) in container.volume_mounts.iter().enumerate() {
            if !volumes.contains(mount.name.as_str()) {
                report.add(
                    format!("{path}/volumeMounts({m})/name"),
                    format!("references undeclared volume '{}'", mount.name),
                );
            }
        }
    }

    for (idx, volume) in pod.volumes.iter().enumerate() {
        if let Some(secret) = &volume.secret {
            if !pod.secrets.contains_key(secret) {
                report.add(
                    format!("/volumes({idx})/secret"),
                    format!("references undeclared secret '{secret}'"),
                );
            }
        }
    }
}

fn check_env(
    env: &BTreeMap<String, EnvValue>,
    declared: &BTreeMap<String, SecretRef>,
    base: &str,
    report: &mut Report,
) {
    for (name, value) in env {
        if let EnvValue::Secret { secret } = value {
            if !declared.contains_key(secret) {
                report.add(
                    format!("{base}/{name}"),
                    format!("references undeclared secret '{secret}'"),
                );
            }
        }
    }
}

fn check_secret_access(
    declared: &BTreeMap<String, SecretRef>,
    store: &dyn SecretStore,
    report: &mut Report,
) {
    for (name, secret) in declared {
        if !store.is_accessible(&secret.source) {
            report.add(
                format!("/secrets/{name}"),
                format!("Secret {} is not accessible", secret.source),
            );
        }
    }
}
