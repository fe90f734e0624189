//! Object store access for the machine controller

use async_trait::async_trait;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use stratus_common::crd::{StratusFirewall, StratusMachine, StratusVpc};
use stratus_common::kube_utils::{add_finalizer, persist_record, remove_finalizer};
use stratus_common::{Error, STRATUS_FINALIZER};

/// Kubernetes operations the machine controller needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineStore: Send + Sync {
    async fn get_vpc(&self, namespace: &str, name: &str) -> Result<Option<StratusVpc>, Error>;

    async fn get_firewall(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StratusFirewall>, Error>;

    async fn add_finalizer(&self, machine: &StratusMachine) -> Result<(), Error>;

    async fn remove_finalizer(&self, machine: &StratusMachine) -> Result<(), Error>;

    async fn persist(
        &self,
        original: &StratusMachine,
        updated: &StratusMachine,
    ) -> Result<(), Error>;
}

/// [`MachineStore`] backed by the Kubernetes API
pub struct KubeMachineStore {
    client: Client,
}

impl KubeMachineStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineStore for KubeMachineStore {
    async fn get_vpc(&self, namespace: &str, name: &str) -> Result<Option<StratusVpc>, Error> {
        let api: Api<StratusVpc> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_firewall(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StratusFirewall>, Error> {
        let api: Api<StratusFirewall> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn add_finalizer(&self, machine: &StratusMachine) -> Result<(), Error> {
        add_finalizer::<StratusMachine>(
            &self.client,
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn remove_finalizer(&self, machine: &StratusMachine) -> Result<(), Error> {
        remove_finalizer::<StratusMachine>(
            &self.client,
            &machine.namespace().unwrap_or_default(),
            &machine.name_any(),
            STRATUS_FINALIZER,
        )
        .await
    }

    async fn persist(
        &self,
        original: &StratusMachine,
        updated: &StratusMachine,
    ) -> Result<(), Error> {
        persist_record(&self.client, original, updated).await
    }
}
