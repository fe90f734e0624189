//! StratusMachine controller
//!
//! Instances are created powered off. The root disk is resized and extra
//! disks are added before the first boot, then the controller waits for the
//! instance to run and publishes its addresses for the cluster controller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use opentelemetry::KeyValue;
use stratus_cloud::types::{
    CloudId, CreateDiskRequest, CreateInstanceRequest, Disk, Instance, InstanceIps,
    InstanceStatus, InterfaceRequest,
};
use stratus_cloud::{CloudClient, Credentials, LimiterRegistry};
use stratus_common::crd::{
    MachineAddress, MachineCondition, ReconcileState, StratusMachine, StratusMachineStatus,
};
use stratus_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::{cloud_label, has_finalizer};
use stratus_common::metrics::ADMISSION_REFUSALS;
use stratus_common::{
    CloudAccess, ControllerConfig, Error, StageTimings, MANAGED_TAG, STRATUS_FINALIZER,
};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{debug, info, instrument, warn};

use crate::store::{KubeMachineStore, MachineStore};

/// Metrics and log label of this controller
pub const KIND: &str = "machine";

const MB_PER_GB: u64 = 1024;
const SWAP_FILESYSTEM: &str = "swap";
const DATA_FILESYSTEM: &str = "ext4";

/// Shared state of the machine controller
pub struct Context {
    pub store: Arc<dyn MachineStore>,
    pub cloud: CloudAccess,
    /// Per-account admission limiters, shared with the HTTP clients
    pub limiters: Arc<LimiterRegistry>,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(
        client: Client,
        cloud: CloudAccess,
        limiters: Arc<LimiterRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store: Arc::new(KubeMachineStore::new(client.clone())),
            cloud,
            limiters,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-machine-controller")),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn MachineStore>,
        cloud: CloudAccess,
        limiters: Arc<LimiterRegistry>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            limiters,
            events: Arc::new(stratus_common::events::NoopEventPublisher),
            config,
        }
    }
}

/// Working copy of one machine for the duration of a pass
pub struct MachineScope {
    record: StratusMachine,
    status: StratusMachineStatus,
    cloud: Arc<dyn CloudClient>,
    credentials: Credentials,
    ctx: Arc<Context>,
}

impl MachineScope {
    fn new(
        machine: &StratusMachine,
        cloud: Arc<dyn CloudClient>,
        credentials: Credentials,
        ctx: Arc<Context>,
    ) -> Self {
        let mut record = machine.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            credentials,
            ctx,
        }
    }

    fn into_record(self) -> StratusMachine {
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

    fn instance_id(&self) -> Result<CloudId, Error> {
        self.record
            .spec
            .instance_id
            .ok_or_else(|| Error::not_ready("instance has not been created"))
    }

    /// Fetch the instance and record the state the cloud reports
    async fn refresh_instance(&mut self) -> Result<Instance, Error> {
        let instance = self.cloud.get_instance(self.instance_id()?).await?;
        self.status.instance_state = Some(instance.status.as_str().to_string());
        Ok(instance)
    }

    fn adopt(&mut self, instance: &Instance) {
        self.record.spec.instance_id = Some(instance.id);
        self.record.spec.provider_id = Some(provider_id(&instance.region, instance.id));
        self.status.instance_state = Some(instance.status.as_str().to_string());
    }

    /// Interfaces for the referenced VPC: public first, then the subnet
    async fn vpc_interfaces(&self) -> Result<Vec<InterfaceRequest>, Error> {
        let Some(vpc_ref) = &self.record.spec.vpc_ref else {
            return Ok(vec![]);
        };
        let namespace = self.namespace();
        let vpc_namespace = vpc_ref.namespace_or(&namespace);
        let vpc = self
            .ctx
            .store
            .get_vpc(vpc_namespace, &vpc_ref.name)
            .await?
            .ok_or_else(|| {
                Error::not_ready(format!("VPC {}/{} not found", vpc_namespace, vpc_ref.name))
            })?;
        let subnet_id = vpc
            .first_subnet_id()
            .filter(|_| vpc.is_ready())
            .ok_or_else(|| {
                Error::not_ready(format!("VPC {}/{} is not ready", vpc_namespace, vpc_ref.name))
            })?;
        Ok(vec![
            InterfaceRequest {
                purpose: "public".to_string(),
                subnet_id: None,
            },
            InterfaceRequest {
                purpose: "vpc".to_string(),
                subnet_id: Some(subnet_id),
            },
        ])
    }

    async fn firewall_id(&self) -> Result<Option<CloudId>, Error> {
        let Some(firewall_ref) = &self.record.spec.firewall_ref else {
            return Ok(None);
        };
        let namespace = self.namespace();
        let firewall_namespace = firewall_ref.namespace_or(&namespace);
        let firewall = self
            .ctx
            .store
            .get_firewall(firewall_namespace, &firewall_ref.name)
            .await?
            .ok_or_else(|| {
                Error::not_ready(format!(
                    "firewall {}/{} not found",
                    firewall_namespace, firewall_ref.name
                ))
            })?;
        firewall.spec.firewall_id.map(Some).ok_or_else(|| {
            Error::not_ready(format!(
                "firewall {}/{} has not been created",
                firewall_namespace, firewall_ref.name
            ))
        })
    }

    /// Take a creation slot from the account's limiter, or defer the stage
    async fn admit_creation(&self) -> Result<(), Error> {
        let limiter = self.ctx.limiters.limiter_for(&self.credentials);
        let refused = limiter.lock().try_admit().err();
        let Some(wait) = refused else {
            return Ok(());
        };

        ADMISSION_REFUSALS.add(1, &[KeyValue::new("kind", KIND)]);
        info!(retry_after_secs = wait.as_secs(), "Instance creation throttled");
        self.ctx
            .events
            .publish(
                &self.record.object_ref(&()),
                EventType::Normal,
                reasons::CREATION_THROTTLED,
                actions::CREATE,
                Some(format!(
                    "instance creation limit reached, retrying in {}s",
                    wait.as_secs()
                )),
            )
            .await;
        Err(Error::not_ready_for("instance creation is throttled", wait))
    }
}

/// `stratus://<region>/<instance id>`
pub fn provider_id(region: &str, id: CloudId) -> String {
    format!("stratus://{}/{}", region, id)
}

impl Staged for MachineScope {
    type Condition = MachineCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<MachineCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<MachineCondition> {
        &mut self.status.state
    }
}

fn create_instance(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        if scope.record.spec.instance_id.is_some() {
            scope.refresh_instance().await?;
            return Ok(());
        }

        let label = cloud_label(&scope.namespace(), &scope.name());
        if let Some(existing) = scope.cloud.find_instance(&label).await? {
            info!(instance = existing.id, "Adopting existing instance");
            scope.adopt(&existing);
            return Ok(());
        }

        let interfaces = scope.vpc_interfaces().await?;
        let firewall_id = scope.firewall_id().await?;
        scope.admit_creation().await?;

        let spec = &scope.record.spec;
        let mut tags = spec.tags.clone();
        tags.push(MANAGED_TAG.to_string());
        let request = CreateInstanceRequest {
            label,
            region: spec.region.clone(),
            instance_type: spec.instance_type.clone(),
            image: spec.image.clone(),
            authorized_keys: spec.authorized_keys.clone(),
            tags,
            private_ip: spec.private_ip,
            booted: false,
            interfaces,
            firewall_id,
        };
        let instance = scope.cloud.create_instance(&request).await?;
        info!(instance = instance.id, "Created instance");
        scope.adopt(&instance);
        Ok(())
    })
}

/// The root disk is the largest disk that is not swap
fn root_disk(disks: &[Disk]) -> Option<&Disk> {
    disks
        .iter()
        .filter(|d| d.filesystem.as_deref() != Some(SWAP_FILESYSTEM))
        .max_by_key(|d| d.size)
}

fn resize_root_disk(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        let Some(size_gb) = scope.record.spec.root_disk_size_gb else {
            return Ok(());
        };
        let id = scope.instance_id()?;
        let disks = scope.cloud.list_instance_disks(id).await?;
        let root = root_disk(&disks)
            .ok_or_else(|| Error::not_ready("instance has no root disk yet"))?;

        let wanted = size_gb * MB_PER_GB;
        if root.size >= wanted {
            debug!(disk = root.id, size_mb = root.size, "Root disk already large enough");
            return Ok(());
        }
        info!(disk = root.id, from_mb = root.size, to_mb = wanted, "Resizing root disk");
        scope.cloud.resize_disk(id, root.id, wanted).await?;
        Ok(())
    })
}

fn create_additional_disks(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        if scope.record.spec.additional_disks.is_empty() {
            return Ok(());
        }
        let id = scope.instance_id()?;
        let disks = scope.cloud.list_instance_disks(id).await?;

        for (label, size_gb) in &scope.record.spec.additional_disks {
            if disks.iter().any(|d| &d.label == label) {
                continue;
            }
            info!(disk = %label, size_gb, "Creating disk");
            scope
                .cloud
                .create_disk(
                    id,
                    &CreateDiskRequest {
                        label: label.clone(),
                        size: size_gb * MB_PER_GB,
                        filesystem: DATA_FILESYSTEM.to_string(),
                    },
                )
                .await?;
        }
        Ok(())
    })
}

fn boot_instance(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        let instance = scope.refresh_instance().await?;
        match instance.status {
            InstanceStatus::Offline => {
                info!(instance = instance.id, "Booting instance");
                scope.cloud.boot_instance(instance.id).await?;
                scope.status.instance_state = Some(InstanceStatus::Booting.as_str().to_string());
                Ok(())
            }
            InstanceStatus::Booting | InstanceStatus::Running => Ok(()),
            other => Err(Error::not_ready(format!(
                "instance is {}, waiting before boot",
                other.as_str()
            ))),
        }
    })
}

fn await_running(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        let instance = scope.refresh_instance().await?;
        if instance.status != InstanceStatus::Running {
            return Err(Error::not_ready(format!(
                "instance is {}",
                instance.status.as_str()
            )));
        }
        Ok(())
    })
}

/// Public addresses become ExternalIP, private and VPC addresses InternalIP
pub fn machine_addresses(ips: &InstanceIps) -> Vec<MachineAddress> {
    ips.public_ipv4
        .iter()
        .chain(ips.ipv6.iter())
        .map(MachineAddress::external)
        .chain(
            ips.private_ipv4
                .iter()
                .chain(ips.vpc_ipv4.iter())
                .map(MachineAddress::internal),
        )
        .collect()
}

fn resolve_addresses(scope: &mut MachineScope) -> StageFuture<'_> {
    Box::pin(async move {
        let ips = scope.cloud.get_instance_ips(scope.instance_id()?).await?;
        let addresses = machine_addresses(&ips);
        if addresses.is_empty() {
            return Err(Error::not_ready("instance has no addresses yet"));
        }
        scope.status.addresses = addresses;
        Ok(())
    })
}

/// Stage plan of a StratusMachine
pub fn machine_plan() -> Result<StagePlan<MachineScope>, Error> {
    use MachineCondition::*;
    Ok(StagePlan::new(vec![
        Stage::once(InstanceCreated, "InstanceProvisioned", create_instance),
        Stage::once(RootDiskResized, "RootDiskSized", resize_root_disk)
            .requires(&[InstanceCreated]),
        Stage::once(AdditionalDisksCreated, "DisksAttached", create_additional_disks)
            .requires(&[InstanceCreated]),
        Stage::once(InstanceBooted, "BootRequested", boot_instance)
            .requires(&[RootDiskResized, AdditionalDisksCreated]),
        Stage::once(InstanceRunning, "InstanceRunning", await_running)
            .requires(&[InstanceBooted]),
        Stage::once(AddressesResolved, "AddressesPublished", resolve_addresses)
            .requires(&[InstanceRunning]),
    ])?)
}

#[async_trait]
impl Teardown for MachineScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let id = match self.record.spec.instance_id {
            Some(id) => id,
            None => {
                // Creation may have succeeded without the ID being persisted
                let label = cloud_label(&self.namespace(), &self.name());
                match self.cloud.find_instance(&label).await? {
                    Some(instance) => instance.id,
                    None => {
                        debug!("No instance was ever created");
                        return Ok(());
                    }
                }
            }
        };
        info!(instance = id, "Deleting instance");
        self.cloud.delete_instance(id).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        self.ctx
            .cloud
            .release(
                &StratusMachine::kind(&()),
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
    type Record = StratusMachine;
    type Scope = MachineScope;

    fn timings(&self) -> &StageTimings {
        &self.config.machine
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<MachineScope>, Error> {
        machine_plan()
    }

    fn state_of(machine: &mut StratusMachine) -> &mut ReconcileState<MachineCondition> {
        &mut machine.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, machine: &StratusMachine) -> Result<(), Error> {
        self.store.add_finalizer(machine).await
    }

    async fn retain(&self, machine: &StratusMachine) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusMachine::kind(&()),
                &machine.name_any(),
                &machine.namespace().unwrap_or_default(),
                machine.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, machine: &StratusMachine) -> Result<MachineScope, Error> {
        let namespace = machine.namespace().unwrap_or_default();
        let (client, credentials) = self
            .cloud
            .client_for(&namespace, machine.spec.credentials_ref.as_ref())
            .await?;
        Ok(MachineScope::new(machine, client, credentials, self))
    }

    fn close(scope: MachineScope) -> StratusMachine {
        scope.into_record()
    }

    async fn persist(
        &self,
        original: &StratusMachine,
        updated: &StratusMachine,
    ) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusMachine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<StratusMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    run_pass(machine, ctx).await
}

/// Requeue a failed pass after the machine retry delay
pub fn error_policy(machine: Arc<StratusMachine>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        machine = %machine.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "Machine reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.machine))
}
