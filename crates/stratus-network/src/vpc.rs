//! StratusVpc controller
//!
//! Creates the VPC with its declared subnets and back-fills the IDs the
//! cloud assigns. A VPC is not deleted while any instance still has an
//! interface in one of its subnets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use stratus_cloud::types::{CloudId, CreateSubnetRequest, CreateVpcRequest, Vpc};
use stratus_cloud::CloudClient;
use stratus_common::crd::{ReconcileState, StratusVpc, StratusVpcStatus, VpcCondition, VpcSubnet};
use stratus_common::events::{EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::{cloud_label, has_finalizer};
use stratus_common::{CloudAccess, ControllerConfig, Error, StageTimings, STRATUS_FINALIZER};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{debug, info, instrument, warn};

use crate::store::{KubeNetworkStore, VpcStore};

/// Metrics and log label of this controller
pub const KIND: &str = "vpc";

/// Shared state of the VPC controller
pub struct VpcContext {
    pub store: Arc<dyn VpcStore>,
    pub cloud: CloudAccess,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl VpcContext {
    pub fn new(client: Client, cloud: CloudAccess, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeNetworkStore::new(client.clone())),
            cloud,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-vpc-controller")),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn VpcStore>,
        cloud: CloudAccess,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            events: Arc::new(stratus_common::events::NoopEventPublisher),
            config,
        }
    }
}

/// Working copy of one VPC for the duration of a pass
pub struct VpcScope {
    record: StratusVpc,
    status: StratusVpcStatus,
    cloud: Arc<dyn CloudClient>,
    ctx: Arc<VpcContext>,
}

impl VpcScope {
    fn new(vpc: &StratusVpc, cloud: Arc<dyn CloudClient>, ctx: Arc<VpcContext>) -> Self {
        let mut record = vpc.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            ctx,
        }
    }

    fn into_record(self) -> StratusVpc {
        let mut record = self.record;
        record.status = Some(self.status);
        record
    }

    fn name(&self) -> String {
        self.record.name_any()
    }

    fn namespace(&self) -> String {
        self.record.namespace().unwrap_or_default()
    }

    fn vpc_id(&self) -> Result<CloudId, Error> {
        self.record
            .spec
            .vpc_id
            .ok_or_else(|| Error::not_ready("VPC has not been created"))
    }

    /// Copy subnet IDs from the cloud onto declared subnets with the same label
    fn backfill_subnets(&mut self, vpc: &Vpc) {
        for declared in self.record.spec.subnets.iter_mut() {
            if let Some(found) = vpc.subnets.iter().find(|s| s.label == declared.label) {
                declared.subnet_id = Some(found.id);
            }
        }
    }
}

impl Staged for VpcScope {
    type Condition = VpcCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<VpcCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<VpcCondition> {
        &mut self.status.state
    }
}

fn subnet_request(subnet: &VpcSubnet) -> CreateSubnetRequest {
    CreateSubnetRequest {
        label: subnet.label.clone(),
        ipv4: subnet.ipv4.clone(),
    }
}

fn create_vpc(scope: &mut VpcScope) -> StageFuture<'_> {
    Box::pin(async move {
        if let Some(id) = scope.record.spec.vpc_id {
            scope.cloud.get_vpc(id).await?;
            return Ok(());
        }

        let label = cloud_label(&scope.namespace(), &scope.name());
        let vpc = match scope.cloud.find_vpc(&label).await? {
            Some(existing) => {
                info!(vpc = existing.id, "Adopting existing VPC");
                existing
            }
            None => {
                let spec = &scope.record.spec;
                let request = CreateVpcRequest {
                    label,
                    region: spec.region.clone(),
                    description: spec.description.clone(),
                    subnets: spec.subnets.iter().map(subnet_request).collect(),
                };
                let vpc = scope.cloud.create_vpc(&request).await?;
                info!(vpc = vpc.id, subnets = vpc.subnets.len(), "Created VPC");
                vpc
            }
        };
        scope.record.spec.vpc_id = Some(vpc.id);
        scope.backfill_subnets(&vpc);
        Ok(())
    })
}

fn reconcile_subnets(scope: &mut VpcScope) -> StageFuture<'_> {
    Box::pin(async move {
        let id = scope.vpc_id()?;
        let vpc = scope.cloud.get_vpc(id).await?;
        scope.backfill_subnets(&vpc);

        let missing: Vec<CreateSubnetRequest> = scope
            .record
            .spec
            .subnets
            .iter()
            .filter(|s| s.subnet_id.is_none())
            .map(subnet_request)
            .collect();
        for request in missing {
            info!(vpc = id, subnet = %request.label, "Creating subnet");
            let subnet = scope.cloud.create_subnet(id, &request).await?;
            if let Some(declared) = scope
                .record
                .spec
                .subnets
                .iter_mut()
                .find(|s| s.label == subnet.label)
            {
                declared.subnet_id = Some(subnet.id);
            }
        }
        Ok(())
    })
}

/// Stage plan of a StratusVpc
pub fn vpc_plan() -> Result<StagePlan<VpcScope>, Error> {
    use VpcCondition::*;
    Ok(StagePlan::new(vec![
        Stage::once(VpcCreated, "VpcProvisioned", create_vpc),
        Stage::once(SubnetsReconciled, "SubnetsProvisioned", reconcile_subnets)
            .requires(&[VpcCreated]),
    ])?)
}

#[async_trait]
impl Teardown for VpcScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn live_dependents(&mut self) -> Result<Vec<String>, Error> {
        let Some(id) = self.record.spec.vpc_id else {
            return Ok(vec![]);
        };
        let vpc = match self.cloud.get_vpc(id).await {
            Ok(vpc) => vpc,
            Err(e) if e.is_not_found() => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        Ok(vpc
            .subnets
            .iter()
            .flat_map(|s| {
                s.instances
                    .iter()
                    .map(move |i| format!("instance {} in subnet {}", i.id, s.label))
            })
            .collect())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let Some(id) = self.record.spec.vpc_id else {
            debug!("No VPC was ever created");
            return Ok(());
        };
        info!(vpc = id, "Deleting VPC");
        self.cloud.delete_vpc(id).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        self.ctx
            .cloud
            .release(
                &StratusVpc::kind(&()),
                &self.name(),
                &self.namespace(),
                self.record.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn release_finalizer(&mut self) -> Result<(), Error> {
        self.ctx.store.remove_finalizer(&self.record).await
    }
}

#[async_trait]
impl Driver for VpcContext {
    type Record = StratusVpc;
    type Scope = VpcScope;

    fn timings(&self) -> &StageTimings {
        &self.config.vpc
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<VpcScope>, Error> {
        vpc_plan()
    }

    fn state_of(vpc: &mut StratusVpc) -> &mut ReconcileState<VpcCondition> {
        &mut vpc.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, vpc: &StratusVpc) -> Result<(), Error> {
        self.store.add_finalizer(vpc).await
    }

    async fn retain(&self, vpc: &StratusVpc) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusVpc::kind(&()),
                &vpc.name_any(),
                &vpc.namespace().unwrap_or_default(),
                vpc.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, vpc: &StratusVpc) -> Result<VpcScope, Error> {
        let namespace = vpc.namespace().unwrap_or_default();
        let (client, _) = self
            .cloud
            .client_for(&namespace, vpc.spec.credentials_ref.as_ref())
            .await?;
        Ok(VpcScope::new(vpc, client, self))
    }

    fn close(scope: VpcScope) -> StratusVpc {
        scope.into_record()
    }

    async fn persist(&self, original: &StratusVpc, updated: &StratusVpc) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusVpc
#[instrument(skip(vpc, ctx), fields(vpc = %vpc.name_any()))]
pub async fn reconcile(vpc: Arc<StratusVpc>, ctx: Arc<VpcContext>) -> Result<Action, Error> {
    run_pass(vpc, ctx).await
}

/// Requeue a failed pass after the VPC retry delay
pub fn error_policy(vpc: Arc<StratusVpc>, error: &Error, ctx: Arc<VpcContext>) -> Action {
    warn!(
        vpc = %vpc.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "VPC reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.vpc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockVpcStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use stratus_cloud::types::{Subnet, SubnetInstance};
    use stratus_cloud::{CloudError, Credentials, MockCloudClient, MockCloudConnector};
    use stratus_common::crd::StratusVpcSpec;
    use stratus_common::MockSecretStore;

    fn vpc() -> StratusVpc {
        let mut vpc = StratusVpc::new(
            "prod-vpc",
            StratusVpcSpec {
                region: "us-ord".into(),
                description: Some("cluster network".into()),
                subnets: vec![
                    VpcSubnet {
                        label: "nodes".into(),
                        ipv4: Some("10.0.0.0/24".into()),
                        subnet_id: None,
                    },
                    VpcSubnet {
                        label: "pods".into(),
                        ipv4: None,
                        subnet_id: None,
                    },
                ],
                vpc_id: None,
                credentials_ref: None,
            },
        );
        vpc.metadata.namespace = Some("default".into());
        vpc.metadata.finalizers = Some(vec![STRATUS_FINALIZER.to_string()]);
        vpc
    }

    fn subnet(id: CloudId, label: &str, instances: &[CloudId]) -> Subnet {
        Subnet {
            id,
            label: label.into(),
            ipv4: None,
            instances: instances.iter().map(|&id| SubnetInstance { id }).collect(),
        }
    }

    fn cloud_vpc(subnets: Vec<Subnet>) -> Vpc {
        Vpc {
            id: 90,
            label: "default-prod-vpc".into(),
            region: "us-ord".into(),
            description: None,
            subnets,
        }
    }

    fn context(store: MockVpcStore, client: MockCloudClient) -> Arc<VpcContext> {
        let client: Arc<dyn CloudClient> = Arc::new(client);
        let mut connector = MockCloudConnector::new();
        connector
            .expect_connect()
            .returning(move |_| client.clone());
        let cloud = CloudAccess::new(
            Arc::new(connector),
            Arc::new(MockSecretStore::new()),
            Some(Credentials::new("operator-token")),
        );
        Arc::new(VpcContext::for_testing(
            Arc::new(store),
            cloud,
            ControllerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn story_new_vpc_is_created_with_its_subnets() {
        let mut client = MockCloudClient::new();
        client
            .expect_find_vpc()
            .with(eq("default-prod-vpc"))
            .returning(|_| Ok(None));
        client
            .expect_create_vpc()
            .withf(|req| req.subnets.len() == 2 && req.region == "us-ord")
            .times(1)
            .returning(|_| {
                Ok(cloud_vpc(vec![
                    subnet(900, "nodes", &[]),
                    subnet(901, "pods", &[]),
                ]))
            });
        client.expect_get_vpc().returning(|_| {
            Ok(cloud_vpc(vec![
                subnet(900, "nodes", &[]),
                subnet(901, "pods", &[]),
            ]))
        });
        client.expect_create_subnet().never();

        let mut store = MockVpcStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let ids: Vec<_> = updated.spec.subnets.iter().map(|s| s.subnet_id).collect();
                updated.spec.vpc_id == Some(90)
                    && ids == vec![Some(900), Some(901)]
                    && updated.status.as_ref().unwrap().state.ready
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(vpc()), context(store, client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_missing_subnets_are_created() {
        let mut existing = vpc();
        existing.spec.vpc_id = Some(90);

        let mut client = MockCloudClient::new();
        client
            .expect_get_vpc()
            .with(eq(90))
            .returning(|_| Ok(cloud_vpc(vec![subnet(900, "nodes", &[])])));
        client
            .expect_create_subnet()
            .withf(|vpc, req| *vpc == 90 && req.label == "pods")
            .times(1)
            .returning(|_, req| Ok(subnet(901, &req.label, &[])));

        let mut store = MockVpcStore::new();
        store
            .expect_persist()
            .withf(|_, updated| updated.spec.subnets[1].subnet_id == Some(901))
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(existing), context(store, client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_deletion_waits_for_attached_instances() {
        let mut deleting = vpc();
        deleting.spec.vpc_id = Some(90);
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client
            .expect_get_vpc()
            .returning(|_| Ok(cloud_vpc(vec![subnet(900, "nodes", &[42])])));
        client.expect_delete_vpc().never();

        let mut store = MockVpcStore::new();
        store.expect_remove_finalizer().never();
        store.expect_persist().times(1).returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().vpc.retry_delay)
        );
    }

    #[tokio::test]
    async fn story_vanished_vpc_is_deleted_cleanly() {
        let mut deleting = vpc();
        deleting.spec.vpc_id = Some(90);
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client
            .expect_get_vpc()
            .returning(|_| Err(CloudError::not_found("vpcs/90")));
        client
            .expect_delete_vpc()
            .returning(|_| Err(CloudError::not_found("vpcs/90")));

        let mut store = MockVpcStore::new();
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn plan_is_valid() {
        assert_eq!(vpc_plan().unwrap().len(), 2);
    }
}
