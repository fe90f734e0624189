//! Object store access for the network controllers

use async_trait::async_trait;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use stratus_common::crd::{AddressSet, FirewallRule, StratusFirewall, StratusVpc};
use stratus_common::kube_utils::{add_finalizer, persist_record, remove_finalizer};
use stratus_common::{Error, STRATUS_FINALIZER};

/// Kubernetes operations the VPC controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VpcStore: Send + Sync {
    async fn add_finalizer(&self, vpc: &StratusVpc) -> Result<(), Error>;

    async fn remove_finalizer(&self, vpc: &StratusVpc) -> Result<(), Error>;

    async fn persist(&self, original: &StratusVpc, updated: &StratusVpc) -> Result<(), Error>;
}

/// Kubernetes operations the firewall controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FirewallStore: Send + Sync {
    async fn get_address_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AddressSet>, Error>;

    async fn get_rule(&self, namespace: &str, name: &str) -> Result<Option<FirewallRule>, Error>;

    async fn add_finalizer(&self, firewall: &StratusFirewall) -> Result<(), Error>;

    async fn remove_finalizer(&self, firewall: &StratusFirewall) -> Result<(), Error>;

    async fn persist(
        &self,
        original: &StratusFirewall,
        updated: &StratusFirewall,
    ) -> Result<(), Error>;
}

/// [`VpcStore`] and [`FirewallStore`] backed by the Kubernetes API
pub struct KubeNetworkStore {
    client: Client,
}

impl KubeNetworkStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VpcStore for KubeNetworkStore {
    async fn add_finalizer(&self, vpc: &StratusVpc) -> Result<(), Error> {
        add_finalizer::<StratusVpc>(
            &self.client,
            &vpc.namespace().unwrap_or_default(),
            &vpc.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, vpc: &StratusVpc) -> Result<(), Error> {
        remove_finalizer::<StratusVpc>(
            &self.client,
            &vpc.namespace().unwrap_or_default(),
            &vpc.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(&self, original: &StratusVpc, updated: &StratusVpc) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}

#[async_trait]
impl FirewallStore for KubeNetworkStore {
    async fn get_address_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AddressSet>, Error> {
        let api: Api<AddressSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_rule(&self, namespace: &str, name: &str) -> Result<Option<FirewallRule>, Error> {
        let api: Api<FirewallRule> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn add_finalizer(&self, firewall: &StratusFirewall) -> Result<(), Error> {
        add_finalizer::<StratusFirewall>(
            &self.client,
            &firewall.namespace().unwrap_or_default(),
            &firewall.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, firewall: &StratusFirewall) -> Result<(), Error> {
        remove_finalizer::<StratusFirewall>(
            &self.client,
            &firewall.namespace().unwrap_or_default(),
            &firewall.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(
        &self,
        original: &StratusFirewall,
        updated: &StratusFirewall,
    ) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}
