//! StratusCluster controller
//!
//! A cluster owns one load balancer in front of its control plane. The
//! stages create it, open the API server port plus any additional ports,
//! publish the control plane endpoint and then keep the load balancer's
//! backends in sync with the control plane machines on every pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, Resource, ResourceExt};
use stratus_cloud::types::{
    CloudId, CreateLoadBalancerConfigRequest, CreateLoadBalancerNodeRequest,
    CreateLoadBalancerRequest, LoadBalancerConfig,
};
use stratus_cloud::CloudClient;
use stratus_common::crd::{
    ApiEndpoint, ClusterCondition, ReconcileState, StratusCluster, StratusClusterStatus,
    StratusMachine,
};
use stratus_common::events::{EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::{cloud_label, has_finalizer, CLOUD_LABEL_MAX};
use stratus_common::{
    CloudAccess, ControllerConfig, Error, StageTimings, MANAGED_TAG, STRATUS_FINALIZER,
};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{debug, info, instrument, warn};

use crate::backends::{select_targets, BackendTarget, Member};
use crate::store::{ClusterStore, KubeClusterStore};

/// Metrics and log label of this controller
pub const KIND: &str = "cluster";

const LB_PROTOCOL: &str = "tcp";
const LB_HEALTH_CHECK: &str = "connection";
const NODE_MODE: &str = "accept";

/// Shared state of the cluster controller
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub cloud: CloudAccess,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(client: Client, cloud: CloudAccess, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeClusterStore::new(client.clone())),
            cloud,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-cluster-controller")),
            config,
        }
    }

    /// Context with injected collaborators, for tests
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ClusterStore>,
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

/// Working copy of one cluster for the duration of a pass
pub struct ClusterScope {
    record: StratusCluster,
    status: StratusClusterStatus,
    cloud: Arc<dyn CloudClient>,
    ctx: Arc<Context>,
}

impl ClusterScope {
    fn new(cluster: &StratusCluster, cloud: Arc<dyn CloudClient>, ctx: Arc<Context>) -> Self {
        let mut record = cluster.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            ctx,
        }
    }

    fn into_record(self) -> StratusCluster {
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

    fn load_balancer_id(&self) -> Result<CloudId, Error> {
        self.record
            .spec
            .network
            .load_balancer_id
            .ok_or_else(|| Error::not_ready("load balancer has not been created"))
    }

    /// Config IDs for every backend port, creating configs that are missing
    async fn ensure_port_configs(&mut self) -> Result<Vec<(u16, CloudId)>, Error> {
        let lb = self.load_balancer_id()?;
        let cloud = self.cloud.clone();
        let existing = cloud.list_load_balancer_configs(lb).await?;
        let network = &mut self.record.spec.network;

        let port = network.api_server_port();
        let id = ensure_config(cloud.as_ref(), lb, &existing, network.api_server_config_id, port)
            .await?;
        network.api_server_config_id = Some(id);
        let mut configs = vec![(port, id)];

        for extra in network.additional_ports.iter_mut() {
            let id = ensure_config(cloud.as_ref(), lb, &existing, extra.config_id, extra.port)
                .await?;
            extra.config_id = Some(id);
            configs.push((extra.port, id));
        }
        Ok(configs)
    }
}

/// Reuse the recorded config, then any config on the same port, else create one
async fn ensure_config(
    cloud: &dyn CloudClient,
    lb: CloudId,
    existing: &[LoadBalancerConfig],
    known: Option<CloudId>,
    port: u16,
) -> Result<CloudId, Error> {
    if let Some(id) = known.filter(|id| existing.iter().any(|c| c.id == *id)) {
        return Ok(id);
    }
    if let Some(config) = existing.iter().find(|c| c.port == port) {
        return Ok(config.id);
    }
    info!(load_balancer = lb, port, "Creating load balancer port");
    let created = cloud
        .create_load_balancer_config(
            lb,
            &CreateLoadBalancerConfigRequest {
                port,
                protocol: LB_PROTOCOL.to_string(),
                check: LB_HEALTH_CHECK.to_string(),
            },
        )
        .await?;
    Ok(created.id)
}

impl Staged for ClusterScope {
    type Condition = ClusterCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<ClusterCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<ClusterCondition> {
        &mut self.status.state
    }
}

fn create_load_balancer(scope: &mut ClusterScope) -> StageFuture<'_> {
    Box::pin(async move {
        if let Some(id) = scope.record.spec.network.load_balancer_id {
            scope.cloud.get_load_balancer(id).await?;
            return Ok(());
        }

        let label = cloud_label(&scope.namespace(), &scope.name());
        let lb = match scope.cloud.find_load_balancer(&label).await? {
            Some(existing) => {
                info!(load_balancer = existing.id, "Adopting existing load balancer");
                existing
            }
            None => {
                let request = CreateLoadBalancerRequest {
                    label,
                    region: scope.record.spec.region.clone(),
                    tags: vec![MANAGED_TAG.to_string()],
                };
                let lb = scope.cloud.create_load_balancer(&request).await?;
                info!(load_balancer = lb.id, "Created load balancer");
                lb
            }
        };
        scope.record.spec.network.load_balancer_id = Some(lb.id);
        Ok(())
    })
}

fn configure_load_balancer(scope: &mut ClusterScope) -> StageFuture<'_> {
    Box::pin(async move {
        scope.ensure_port_configs().await?;
        Ok(())
    })
}

fn assign_endpoint(scope: &mut ClusterScope) -> StageFuture<'_> {
    Box::pin(async move {
        if scope.record.spec.control_plane_endpoint.is_some() {
            return Ok(());
        }
        let lb = scope.cloud.get_load_balancer(scope.load_balancer_id()?).await?;
        let host = lb
            .ipv4
            .or(lb.hostname)
            .ok_or_else(|| Error::not_ready("load balancer has no address yet"))?;
        let port = scope.record.spec.network.api_server_port();
        info!(%host, port, "Control plane endpoint assigned");
        scope.record.spec.control_plane_endpoint = Some(ApiEndpoint { host, port });
        Ok(())
    })
}

fn sync_backends(scope: &mut ClusterScope) -> StageFuture<'_> {
    Box::pin(async move {
        // Ports added to the spec after creation get their configs here
        let configs = scope.ensure_port_configs().await?;
        let lb = scope.load_balancer_id()?;

        let machines = scope
            .ctx
            .store
            .list_machines(&scope.namespace(), &scope.name())
            .await?;
        let members: Vec<Member<'_>> = control_plane_members(&machines).collect();
        let targets = select_targets(&members, &scope.record.spec.network);

        for (port, config) in configs {
            let desired: Vec<&BackendTarget> = targets.iter().filter(|t| t.port == port).collect();
            sync_port(scope.cloud.as_ref(), lb, config, &desired).await?;
        }
        Ok(())
    })
}

fn control_plane_members(machines: &[StratusMachine]) -> impl Iterator<Item = Member<'_>> {
    machines
        .iter()
        .filter(|m| m.is_control_plane() && m.metadata.deletion_timestamp.is_none())
        .map(|m| Member {
            name: m.metadata.name.as_deref().unwrap_or_default(),
            addresses: m.addresses(),
        })
}

/// Make the nodes of one port config match `desired`. New backends are
/// added before stale ones are removed.
async fn sync_port(
    cloud: &dyn CloudClient,
    lb: CloudId,
    config: CloudId,
    desired: &[&BackendTarget],
) -> Result<(), Error> {
    let nodes = cloud.list_load_balancer_nodes(lb, config).await?;

    for target in desired {
        let endpoint = target.endpoint();
        if nodes.iter().any(|n| n.address == endpoint) {
            continue;
        }
        info!(backend = %endpoint, member = %target.member, "Adding load balancer backend");
        cloud
            .create_load_balancer_node(
                lb,
                config,
                &CreateLoadBalancerNodeRequest {
                    address: endpoint,
                    label: node_label(&target.member),
                    mode: NODE_MODE.to_string(),
                },
            )
            .await?;
    }

    for node in nodes
        .iter()
        .filter(|n| !desired.iter().any(|t| t.endpoint() == n.address))
    {
        info!(backend = %node.address, "Removing load balancer backend");
        match cloud.delete_load_balancer_node(lb, config, node.id).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
    }
    Ok(())
}

fn node_label(member: &str) -> String {
    member.chars().take(CLOUD_LABEL_MAX).collect()
}

/// Stage plan of a StratusCluster
pub fn cluster_plan() -> Result<StagePlan<ClusterScope>, Error> {
    use ClusterCondition::*;
    Ok(StagePlan::new(vec![
        Stage::once(LoadBalancerCreated, "LoadBalancerProvisioned", create_load_balancer),
        Stage::once(LoadBalancerConfigured, "PortsConfigured", configure_load_balancer)
            .requires(&[LoadBalancerCreated]),
        Stage::once(EndpointAssigned, "EndpointPublished", assign_endpoint)
            .requires(&[LoadBalancerCreated]),
        Stage::every_pass(BackendsSynced, "BackendsInSync", sync_backends)
            .requires(&[LoadBalancerConfigured]),
    ])?)
}

#[async_trait]
impl Teardown for ClusterScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn live_dependents(&mut self) -> Result<Vec<String>, Error> {
        let machines = self
            .ctx
            .store
            .list_machines(&self.namespace(), &self.name())
            .await?;
        Ok(machines.iter().map(|m| m.name_any()).collect())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let Some(id) = self.record.spec.network.load_balancer_id else {
            debug!("No load balancer was ever created");
            return Ok(());
        };
        info!(load_balancer = id, "Deleting load balancer");
        self.cloud.delete_load_balancer(id).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        self.ctx
            .cloud
            .release(
                &StratusCluster::kind(&()),
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
impl Driver for Context {
    type Record = StratusCluster;
    type Scope = ClusterScope;

    fn timings(&self) -> &StageTimings {
        &self.config.cluster
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<ClusterScope>, Error> {
        cluster_plan()
    }

    fn state_of(cluster: &mut StratusCluster) -> &mut ReconcileState<ClusterCondition> {
        &mut cluster.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, cluster: &StratusCluster) -> Result<(), Error> {
        self.store.add_finalizer(cluster).await
    }

    async fn retain(&self, cluster: &StratusCluster) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusCluster::kind(&()),
                &cluster.name_any(),
                &cluster.namespace().unwrap_or_default(),
                cluster.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, cluster: &StratusCluster) -> Result<ClusterScope, Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let (client, _) = self
            .cloud
            .client_for(&namespace, cluster.spec.credentials_ref.as_ref())
            .await?;
        Ok(ClusterScope::new(cluster, client, self))
    }

    fn close(scope: ClusterScope) -> StratusCluster {
        scope.into_record()
    }

    async fn persist(
        &self,
        original: &StratusCluster,
        updated: &StratusCluster,
    ) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<StratusCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    run_pass(cluster, ctx).await
}

/// Requeue a failed pass after the cluster retry delay
pub fn error_policy(cluster: Arc<StratusCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        cluster = %cluster.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "Cluster reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.cluster))
}

/// Cluster to revisit when a member machine changes
pub fn cluster_for_machine(machine: &StratusMachine) -> Option<ObjectRef<StratusCluster>> {
    let cluster = machine.cluster_name()?;
    let namespace = machine.namespace()?;
    Some(ObjectRef::new(cluster).within(&namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockClusterStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;
    use stratus_cloud::types::{LoadBalancer, LoadBalancerNode};
    use stratus_cloud::{Credentials, MockCloudClient, MockCloudConnector};
    use stratus_common::crd::{
        ClusterNetwork, LoadBalancerPort, MachineAddress, StratusClusterSpec, StratusMachineSpec,
        StratusMachineStatus, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL,
    };
    use stratus_common::MockSecretStore;

    fn cluster() -> StratusCluster {
        let mut cluster = StratusCluster::new(
            "prod",
            StratusClusterSpec {
                region: "us-ord".into(),
                network: ClusterNetwork {
                    additional_ports: vec![LoadBalancerPort {
                        port: 8132,
                        config_id: None,
                    }],
                    ..Default::default()
                },
                control_plane_endpoint: None,
                vpc_ref: None,
                credentials_ref: None,
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster.metadata.finalizers = Some(vec![STRATUS_FINALIZER.to_string()]);
        cluster
    }

    fn control_plane_machine(name: &str, internal: &str) -> StratusMachine {
        let mut machine = StratusMachine::new(
            name,
            StratusMachineSpec {
                region: "us-ord".into(),
                instance_type: "g6-standard-2".into(),
                image: "ubuntu-24.04".into(),
                root_disk_size_gb: None,
                additional_disks: BTreeMap::new(),
                authorized_keys: vec![],
                tags: vec![],
                private_ip: true,
                vpc_ref: None,
                firewall_ref: None,
                credentials_ref: None,
                instance_id: None,
                provider_id: None,
            },
        );
        machine.metadata.namespace = Some("default".into());
        machine.metadata.labels = Some(BTreeMap::from([
            (CLUSTER_NAME_LABEL.to_string(), "prod".to_string()),
            (CONTROL_PLANE_LABEL.to_string(), String::new()),
        ]));
        machine.status = Some(StratusMachineStatus {
            addresses: vec![MachineAddress::internal(internal)],
            ..Default::default()
        });
        machine
    }

    fn load_balancer() -> LoadBalancer {
        LoadBalancer {
            id: 7,
            label: "default-prod".into(),
            region: "us-ord".into(),
            hostname: Some("lb-7.stratus.cloud".into()),
            ipv4: Some("172.232.1.1".into()),
            ipv6: None,
        }
    }

    fn context(store: MockClusterStore, client: MockCloudClient) -> Arc<Context> {
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
        Arc::new(Context::for_testing(
            Arc::new(store),
            cloud,
            ControllerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn story_first_pass_only_adds_the_finalizer() {
        let mut fresh = cluster();
        fresh.metadata.finalizers = None;

        let mut store = MockClusterStore::new();
        store.expect_add_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().never();
        let ctx = context(store, MockCloudClient::new());

        let action = reconcile(Arc::new(fresh), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn story_new_cluster_converges_to_ready() {
        let mut client = MockCloudClient::new();
        client
            .expect_find_load_balancer()
            .with(eq("default-prod"))
            .returning(|_| Ok(None));
        client
            .expect_create_load_balancer()
            .times(1)
            .returning(|_| Ok(load_balancer()));
        client
            .expect_get_load_balancer()
            .returning(|_| Ok(load_balancer()));
        client
            .expect_list_load_balancer_configs()
            .returning(|_| Ok(vec![]));
        client
            .expect_create_load_balancer_config()
            .returning(|_, req| {
                Ok(LoadBalancerConfig {
                    id: u64::from(req.port),
                    port: req.port,
                    protocol: req.protocol.clone(),
                })
            });
        client
            .expect_list_load_balancer_nodes()
            .returning(|_, _| Ok(vec![]));
        client
            .expect_create_load_balancer_node()
            .times(2)
            .returning(|_, config, req| {
                Ok(LoadBalancerNode {
                    id: config,
                    address: req.address.clone(),
                    label: req.label.clone(),
                })
            });

        let mut store = MockClusterStore::new();
        store
            .expect_list_machines()
            .with(eq("default"), eq("prod"))
            .returning(|_, _| Ok(vec![control_plane_machine("prod-cp-0", "192.168.128.4")]));
        store
            .expect_persist()
            .withf(|_, updated| {
                let status = updated.status.as_ref().unwrap();
                let network = &updated.spec.network;
                status.state.ready
                    && network.load_balancer_id == Some(7)
                    && network.api_server_config_id == Some(6443)
                    && network.additional_ports[0].config_id == Some(8132)
                    && updated.spec.control_plane_endpoint
                        == Some(ApiEndpoint {
                            host: "172.232.1.1".into(),
                            port: 6443,
                        })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(cluster()), context(store, client))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().resync_interval)
        );
    }

    #[tokio::test]
    async fn story_stale_backends_are_removed() {
        let mut ready = cluster();
        ready.spec.network.load_balancer_id = Some(7);
        ready.spec.network.api_server_config_id = Some(1);
        ready.spec.network.additional_ports.clear();

        let mut client = MockCloudClient::new();
        client.expect_get_load_balancer().returning(|_| Ok(load_balancer()));
        client.expect_list_load_balancer_configs().returning(|_| {
            Ok(vec![LoadBalancerConfig {
                id: 1,
                port: 6443,
                protocol: "tcp".into(),
            }])
        });
        client.expect_list_load_balancer_nodes().returning(|_, _| {
            Ok(vec![
                LoadBalancerNode {
                    id: 10,
                    address: "192.168.128.4:6443".into(),
                    label: "prod-cp-0".into(),
                },
                LoadBalancerNode {
                    id: 11,
                    address: "192.168.128.99:6443".into(),
                    label: "gone".into(),
                },
            ])
        });
        client.expect_create_load_balancer_node().never();
        client
            .expect_delete_load_balancer_node()
            .with(eq(7), eq(1), eq(11))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut store = MockClusterStore::new();
        store
            .expect_list_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("prod-cp-0", "192.168.128.4")]));
        store.expect_persist().times(1).returning(|_, _| Ok(()));

        reconcile(Arc::new(ready), context(store, client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_deletion_waits_for_member_machines() {
        let mut deleting = cluster();
        deleting.spec.network.load_balancer_id = Some(7);
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client.expect_delete_load_balancer().never();

        let mut store = MockClusterStore::new();
        store
            .expect_list_machines()
            .returning(|_, _| Ok(vec![control_plane_machine("prod-cp-0", "192.168.128.4")]));
        store.expect_remove_finalizer().never();
        store
            .expect_persist()
            .withf(|_, updated| {
                let state = &updated.status.as_ref().unwrap().state;
                !state.ready && state.failure_reason.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().cluster.retry_delay)
        );
    }

    #[tokio::test]
    async fn story_deletion_removes_load_balancer_then_finalizer() {
        let mut deleting = cluster();
        deleting.spec.network.load_balancer_id = Some(7);
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client
            .expect_delete_load_balancer()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let mut store = MockClusterStore::new();
        store.expect_list_machines().returning(|_, _| Ok(vec![]));
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn plan_is_valid() {
        assert_eq!(cluster_plan().unwrap().len(), 4);
    }

    #[test]
    fn machines_map_to_their_cluster() {
        let machine = control_plane_machine("prod-cp-0", "192.168.128.4");
        let target = cluster_for_machine(&machine).unwrap();
        assert_eq!(target.name, "prod");
        assert_eq!(target.namespace.as_deref(), Some("default"));
    }
}
