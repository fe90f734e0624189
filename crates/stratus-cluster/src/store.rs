//! Object store access for the cluster controller

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use stratus_common::crd::{StratusCluster, StratusMachine, CLUSTER_NAME_LABEL};
use stratus_common::kube_utils::{add_finalizer, persist_record, remove_finalizer};
use stratus_common::{Error, STRATUS_FINALIZER};

/// Kubernetes operations the cluster controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Machines labelled as members of the cluster
    async fn list_machines(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<StratusMachine>, Error>;

    async fn add_finalizer(&self, cluster: &StratusCluster) -> Result<(), Error>;

    async fn remove_finalizer(&self, cluster: &StratusCluster) -> Result<(), Error>;

    /// Write back spec back-fill and status
    async fn persist(
        &self,
        original: &StratusCluster,
        updated: &StratusCluster,
    ) -> Result<(), Error>;
}

/// [`ClusterStore`] backed by the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list_machines(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Vec<StratusMachine>, Error> {
        let api: Api<StratusMachine> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_NAME_LABEL, cluster));
        Ok(api.list(&params).await?.items)
    }

    async fn add_finalizer(&self, cluster: &StratusCluster) -> Result<(), Error> {
        add_finalizer::<StratusCluster>(
            &self.client,
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, cluster: &StratusCluster) -> Result<(), Error> {
        remove_finalizer::<StratusCluster>(
            &self.client,
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(
        &self,
        original: &StratusCluster,
        updated: &StratusCluster,
    ) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}
