//! Object store access for the storage controllers

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use stratus_common::crd::{StratusBucket, StratusKey};
use stratus_common::kube_utils::{add_finalizer, persist_record, remove_finalizer};
use stratus_common::{Error, STRATUS_FINALIZER};

/// Kubernetes operations the bucket controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Every key in the namespace; callers filter by grant
    async fn list_keys(&self, namespace: &str) -> Result<Vec<StratusKey>, Error>;

    async fn add_finalizer(&self, bucket: &StratusBucket) -> Result<(), Error>;

    async fn remove_finalizer(&self, bucket: &StratusBucket) -> Result<(), Error>;

    async fn persist(
        &self,
        original: &StratusBucket,
        updated: &StratusBucket,
    ) -> Result<(), Error>;
}

/// Kubernetes operations the key controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn add_finalizer(&self, key: &StratusKey) -> Result<(), Error>;

    async fn remove_finalizer(&self, key: &StratusKey) -> Result<(), Error>;

    async fn persist(&self, original: &StratusKey, updated: &StratusKey) -> Result<(), Error>;
}

/// [`BucketStore`] and [`KeyStore`] backed by the Kubernetes API
pub struct KubeStorageStore {
    client: Client,
}

impl KubeStorageStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BucketStore for KubeStorageStore {
    async fn list_keys(&self, namespace: &str) -> Result<Vec<StratusKey>, Error> {
        let api: Api<StratusKey> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn add_finalizer(&self, bucket: &StratusBucket) -> Result<(), Error> {
        add_finalizer::<StratusBucket>(
            &self.client,
            &bucket.namespace().unwrap_or_default(),
            &bucket.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, bucket: &StratusBucket) -> Result<(), Error> {
        remove_finalizer::<StratusBucket>(
            &self.client,
            &bucket.namespace().unwrap_or_default(),
            &bucket.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(
        &self,
        original: &StratusBucket,
        updated: &StratusBucket,
    ) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}

#[async_trait]
impl KeyStore for KubeStorageStore {
    async fn add_finalizer(&self, key: &StratusKey) -> Result<(), Error> {
        add_finalizer::<StratusKey>(
            &self.client,
            &key.namespace().unwrap_or_default(),
            &key.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, key: &StratusKey) -> Result<(), Error> {
        remove_finalizer::<StratusKey>(
            &self.client,
            &key.namespace().unwrap_or_default(),
            &key.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(&self, original: &StratusKey, updated: &StratusKey) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}
