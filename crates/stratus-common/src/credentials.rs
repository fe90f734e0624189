//! Resolving cloud credentials from Secrets and pinning those Secrets
//! while resources still need them

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use stratus_cloud::{CloudClient, CloudConnector, Credentials};

use crate::config::FIELD_MANAGER;
use crate::crd::SecretRef;
use crate::kube_utils::{add_finalizer, deterministic_hash, remove_finalizer};
use crate::Error;

/// Secret key holding the API token
pub const API_TOKEN_KEY: &str = "apiToken";

const API_GROUP: &str = "infrastructure.stratus.dev";

/// Finalizer a resource places on its credentials Secret.
///
/// One per referencing object, so the Secret stays until the last user
/// is gone. Long names are hashed to fit the finalizer name limit.
pub fn credentials_finalizer(kind: &str, name: &str) -> String {
    let suffix = if name.len() > 63 {
        deterministic_hash(name)
    } else {
        name.to_string()
    };
    format!("{}.{}/{}", kind.to_ascii_lowercase(), API_GROUP, suffix)
}

/// Access to the Secrets controllers read and write
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    /// Create or replace a Secret owned by the operator
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<(), Error>;
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("apply_secret", "secret has no name"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(secret),
        )
        .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<(), Error> {
        add_finalizer::<Secret>(&self.client, namespace, name, finalizer).await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        remove_finalizer::<Secret>(&self.client, namespace, name, finalizer).await
    }
}

/// Read a string value out of a Secret
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let bytes = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.0.clone()).ok()
}

/// Build an Opaque Secret from string values
pub fn opaque_secret(namespace: &str, name: &str, values: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            values
                .into_iter()
                .map(|(k, v)| (k, ByteString(v.into_bytes())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Hands out cloud clients for the credentials a resource references
#[derive(Clone)]
pub struct CloudAccess {
    connector: Arc<dyn CloudConnector>,
    secrets: Arc<dyn SecretStore>,
    default_credentials: Option<Credentials>,
}

impl CloudAccess {
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        secrets: Arc<dyn SecretStore>,
        default_credentials: Option<Credentials>,
    ) -> Self {
        Self {
            connector,
            secrets,
            default_credentials,
        }
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Credentials from the referenced Secret, or the operator default
    pub async fn resolve(
        &self,
        namespace: &str,
        credentials_ref: Option<&SecretRef>,
    ) -> Result<Credentials, Error> {
        let Some(secret_ref) = credentials_ref else {
            return self.default_credentials.clone().ok_or_else(|| {
                Error::validation_for_field(
                    namespace,
                    "spec.credentialsRef",
                    "no credentialsRef set and the operator has no default API token",
                )
            });
        };

        let secret_namespace = secret_ref.namespace_or(namespace);
        let secret = self
            .secrets
            .get_secret(secret_namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| {
                Error::not_ready(format!(
                    "credentials secret {}/{} not found",
                    secret_namespace, secret_ref.name
                ))
            })?;
        let token = secret_value(&secret, API_TOKEN_KEY).ok_or_else(|| {
            Error::validation_for_field(
                &secret_ref.name,
                API_TOKEN_KEY,
                format!(
                    "secret {}/{} has no {} key",
                    secret_namespace, secret_ref.name, API_TOKEN_KEY
                ),
            )
        })?;
        Ok(Credentials::new(token))
    }

    /// A client and the credentials it uses
    pub async fn client_for(
        &self,
        namespace: &str,
        credentials_ref: Option<&SecretRef>,
    ) -> Result<(Arc<dyn CloudClient>, Credentials), Error> {
        let credentials = self.resolve(namespace, credentials_ref).await?;
        Ok((self.connector.connect(&credentials), credentials))
    }

    /// Pin the referenced Secret so it outlives the resource using it
    pub async fn retain(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        credentials_ref: Option<&SecretRef>,
    ) -> Result<(), Error> {
        if let Some(secret_ref) = credentials_ref {
            self.secrets
                .add_finalizer(
                    secret_ref.namespace_or(namespace),
                    &secret_ref.name,
                    &credentials_finalizer(kind, name),
                )
                .await?;
        }
        Ok(())
    }

    /// Undo [`CloudAccess::retain`]
    pub async fn release(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        credentials_ref: Option<&SecretRef>,
    ) -> Result<(), Error> {
        if let Some(secret_ref) = credentials_ref {
            self.secrets
                .remove_finalizer(
                    secret_ref.namespace_or(namespace),
                    &secret_ref.name,
                    &credentials_finalizer(kind, name),
                )
                .await?;
        }
        Ok(())
    }
}
