//! Kubernetes helpers shared by the controllers

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::FIELD_MANAGER;
use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Spec and status sections that differ between two versions of a record
#[derive(Debug, Default, PartialEq)]
pub struct RecordChanges {
    pub spec: Option<Value>,
    pub status: Option<Value>,
}

impl RecordChanges {
    pub fn is_empty(&self) -> bool {
        self.spec.is_none() && self.status.is_none()
    }
}

/// JSON merge patch (RFC 7386) turning `before` into `after`, or None when
/// they are equal. Fields dropped from `after` become explicit nulls so that
/// cleared optional fields are removed on the server too.
pub fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = serde_json::Map::new();
            for (key, new_value) in new {
                let old_value = old.get(key).unwrap_or(&Value::Null);
                if let Some(diff) = merge_diff(old_value, new_value) {
                    patch.insert(key.clone(), diff);
                }
            }
            for key in old.keys().filter(|k| !new.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            Some(Value::Object(patch))
        }
        _ => Some(after.clone()),
    }
}

/// Compare two serialized records section by section
pub fn record_changes(before: &Value, after: &Value) -> RecordChanges {
    let changed = |key: &str| {
        merge_diff(
            before.get(key).unwrap_or(&Value::Null),
            after.get(key).unwrap_or(&Value::Null),
        )
    };
    RecordChanges {
        spec: changed("spec"),
        status: changed("status"),
    }
}

/// Write back the spec back-fill and status a pass produced.
///
/// Only sections that changed are patched, spec before status. A record
/// that disappeared in the meantime is not an error.
pub async fn persist_record<K>(client: &Client, original: &K, updated: &K) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize,
{
    let before = serde_json::to_value(original).map_err(|e| Error::serialization(e.to_string()))?;
    let after = serde_json::to_value(updated).map_err(|e| Error::serialization(e.to_string()))?;
    let changes = record_changes(&before, &after);
    if changes.is_empty() {
        return Ok(());
    }

    let name = updated.name_any();
    let api: Api<K> = Api::namespaced(client.clone(), &updated.namespace().unwrap_or_default());
    let params = PatchParams::apply(FIELD_MANAGER);

    let result = async {
        if let Some(spec) = changes.spec {
            debug!(kind = %K::kind(&()), %name, "Persisting spec back-fill");
            api.patch(&name, &params, &Patch::Merge(&json!({ "spec": spec })))
                .await?;
        }
        if let Some(status) = changes.status {
            api.patch_status(&name, &params, &Patch::Merge(&json!({ "status": status })))
                .await?;
        }
        Ok::<(), kube::Error>(())
    }
    .await;

    match result {
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(%name, "Record gone before its status could be written");
            Ok(())
        }
        other => other.map_err(Error::from),
    }
}

/// Finalizer list with `finalizer` added, or None when already present
pub fn with_finalizer(existing: &[String], finalizer: &str) -> Option<Vec<String>> {
    if existing.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut finalizers = existing.to_vec();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or None when absent
pub fn without_finalizer(existing: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !existing.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        existing
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: Vec<String>) -> Result<(), Error>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Add a finalizer to a namespaced object, reading its current list first
pub async fn add_finalizer<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let current = api.get(name).await?;
    match with_finalizer(current.finalizers(), finalizer) {
        Some(finalizers) => patch_finalizers(&api, name, finalizers).await,
        None => Ok(()),
    }
}

/// Remove a finalizer from a namespaced object. An object that is already
/// gone has nothing left to release.
pub async fn remove_finalizer<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    finalizer: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let Some(current) = api.get_opt(name).await? else {
        return Ok(());
    };
    match without_finalizer(current.finalizers(), finalizer) {
        Some(finalizers) => patch_finalizers(&api, name, finalizers).await,
        None => Ok(()),
    }
}

/// Longest label the cloud API accepts
pub const CLOUD_LABEL_MAX: usize = 32;

/// Label of the cloud object owned by `namespace/name`.
///
/// Stable across passes so an object created by a pass whose status was
/// never persisted can be found again. Long names keep a readable prefix
/// and end in a hash.
pub fn cloud_label(namespace: &str, name: &str) -> String {
    let label = format!("{}-{}", namespace, name);
    if label.len() <= CLOUD_LABEL_MAX {
        return label;
    }
    let hash = deterministic_hash(&label);
    let prefix: String = label.chars().take(CLOUD_LABEL_MAX - hash.len() - 1).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), hash)
}

/// Short stable hash of a string, as 16 hex characters
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
