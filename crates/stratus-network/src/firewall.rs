//! StratusFirewall controller
//!
//! Rules are rebuilt from the declaration, its FirewallRule references and
//! the AddressSets they name on every pass, and pushed to the cloud only
//! when they differ from what the firewall currently enforces.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef as WatchRef;
use kube::{Client, Resource, ResourceExt};
use stratus_cloud::types::{CloudId, CreateFirewallRequest};
use stratus_cloud::CloudClient;
use stratus_common::crd::{
    AddressSet, FirewallCondition, FirewallRule, FirewallRuleSpec, ObjectRef, ReconcileState,
    StratusFirewall, StratusFirewallStatus,
};
use stratus_common::events::{EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::{cloud_label, has_finalizer};
use stratus_common::{
    CloudAccess, ControllerConfig, Error, StageTimings, MANAGED_TAG, STRATUS_FINALIZER,
};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{debug, info, instrument, warn};

use crate::rules::{build_rules, DeclaredRules, ResolvedRule};
use crate::store::{FirewallStore, KubeNetworkStore};

/// Metrics and log label of this controller
pub const KIND: &str = "firewall";

const STATUS_ENABLED: &str = "enabled";
const STATUS_DISABLED: &str = "disabled";

/// Shared state of the firewall controller
pub struct FirewallContext {
    pub store: Arc<dyn FirewallStore>,
    pub cloud: CloudAccess,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl FirewallContext {
    pub fn new(client: Client, cloud: CloudAccess, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeNetworkStore::new(client.clone())),
            cloud,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-firewall-controller")),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn FirewallStore>,
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

/// Working copy of one firewall for the duration of a pass
pub struct FirewallScope {
    record: StratusFirewall,
    status: StratusFirewallStatus,
    cloud: Arc<dyn CloudClient>,
    ctx: Arc<FirewallContext>,
}

impl FirewallScope {
    fn new(
        firewall: &StratusFirewall,
        cloud: Arc<dyn CloudClient>,
        ctx: Arc<FirewallContext>,
    ) -> Self {
        let mut record = firewall.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            ctx,
        }
    }

    fn into_record(self) -> StratusFirewall {
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

    fn firewall_id(&self) -> Result<CloudId, Error> {
        self.record
            .spec
            .firewall_id
            .ok_or_else(|| Error::not_ready("firewall has not been created"))
    }

    /// Inline addresses plus those of every referenced AddressSet
    async fn resolve(&self, spec: FirewallRuleSpec, namespace: &str) -> Result<ResolvedRule, Error> {
        let set_refs = spec.address_set_refs.clone();
        let mut rule = ResolvedRule::new(spec);
        for set_ref in &set_refs {
            let set_namespace = set_ref.namespace_or(namespace);
            let set = self
                .ctx
                .store
                .get_address_set(set_namespace, &set_ref.name)
                .await?
                .ok_or_else(|| {
                    Error::not_ready(format!(
                        "address set {}/{} not found",
                        set_namespace, set_ref.name
                    ))
                })?;
            rule.extend(
                set.spec.ipv4.as_deref().unwrap_or_default(),
                set.spec.ipv6.as_deref().unwrap_or_default(),
            );
        }
        Ok(rule)
    }

    /// Inline rules first, then referenced FirewallRule objects in order
    async fn resolve_direction(
        &self,
        inline: &[FirewallRuleSpec],
        refs: &[ObjectRef],
    ) -> Result<Vec<ResolvedRule>, Error> {
        let namespace = self.namespace();
        let mut resolved = Vec::with_capacity(inline.len() + refs.len());
        for spec in inline {
            resolved.push(self.resolve(spec.clone(), &namespace).await?);
        }
        for rule_ref in refs {
            let rule_namespace = rule_ref.namespace_or(&namespace);
            let rule = self
                .ctx
                .store
                .get_rule(rule_namespace, &rule_ref.name)
                .await?
                .ok_or_else(|| {
                    Error::not_ready(format!(
                        "firewall rule {}/{} not found",
                        rule_namespace, rule_ref.name
                    ))
                })?;
            resolved.push(self.resolve(rule.spec, rule_namespace).await?);
        }
        Ok(resolved)
    }

    async fn declared_rules(&self) -> Result<DeclaredRules, Error> {
        let spec = &self.record.spec;
        Ok(DeclaredRules {
            inbound: self
                .resolve_direction(&spec.inbound_rules, &spec.inbound_rule_refs)
                .await?,
            inbound_policy: spec.inbound_policy,
            outbound: self
                .resolve_direction(&spec.outbound_rules, &spec.outbound_rule_refs)
                .await?,
            outbound_policy: spec.outbound_policy,
        })
    }
}

impl Staged for FirewallScope {
    type Condition = FirewallCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<FirewallCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<FirewallCondition> {
        &mut self.status.state
    }
}

fn create_firewall(scope: &mut FirewallScope) -> StageFuture<'_> {
    Box::pin(async move {
        if let Some(id) = scope.record.spec.firewall_id {
            scope.cloud.get_firewall(id).await?;
            return Ok(());
        }

        let label = cloud_label(&scope.namespace(), &scope.name());
        let firewall = match scope.cloud.find_firewall(&label).await? {
            Some(existing) => {
                info!(firewall = existing.id, "Adopting existing firewall");
                existing
            }
            None => {
                let rules = build_rules(&scope.declared_rules().await?)?;
                let request = CreateFirewallRequest {
                    label,
                    rules,
                    tags: vec![MANAGED_TAG.to_string()],
                };
                let firewall = scope.cloud.create_firewall(&request).await?;
                info!(firewall = firewall.id, "Created firewall");
                firewall
            }
        };
        scope.record.spec.firewall_id = Some(firewall.id);
        Ok(())
    })
}

fn apply_rules(scope: &mut FirewallScope) -> StageFuture<'_> {
    Box::pin(async move {
        let id = scope.firewall_id()?;
        let desired = build_rules(&scope.declared_rules().await?)?;

        let current = scope.cloud.get_firewall_rules(id).await?;
        if current != desired {
            info!(
                firewall = id,
                inbound = desired.inbound.len(),
                outbound = desired.outbound.len(),
                "Updating firewall rules"
            );
            scope.cloud.update_firewall_rules(id, &desired).await?;
        } else {
            debug!(firewall = id, "Firewall rules up to date");
        }

        let enabled = scope.record.spec.enabled;
        let wanted = if enabled { STATUS_ENABLED } else { STATUS_DISABLED };
        let firewall = scope.cloud.get_firewall(id).await?;
        if firewall.status != wanted {
            info!(firewall = id, status = wanted, "Changing firewall status");
            scope.cloud.set_firewall_status(id, enabled).await?;
        }
        Ok(())
    })
}

/// Stage plan of a StratusFirewall
pub fn firewall_plan() -> Result<StagePlan<FirewallScope>, Error> {
    use FirewallCondition::*;
    Ok(StagePlan::new(vec![
        Stage::once(FirewallCreated, "FirewallProvisioned", create_firewall),
        Stage::every_pass(RulesApplied, "RulesInSync", apply_rules).requires(&[FirewallCreated]),
    ])?)
}

#[async_trait]
impl Teardown for FirewallScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let Some(id) = self.record.spec.firewall_id else {
            debug!("No firewall was ever created");
            return Ok(());
        };
        info!(firewall = id, "Deleting firewall");
        self.cloud.delete_firewall(id).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        self.ctx
            .cloud
            .release(
                &StratusFirewall::kind(&()),
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
impl Driver for FirewallContext {
    type Record = StratusFirewall;
    type Scope = FirewallScope;

    fn timings(&self) -> &StageTimings {
        &self.config.firewall
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<FirewallScope>, Error> {
        firewall_plan()
    }

    fn state_of(firewall: &mut StratusFirewall) -> &mut ReconcileState<FirewallCondition> {
        &mut firewall.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, firewall: &StratusFirewall) -> Result<(), Error> {
        self.store.add_finalizer(firewall).await
    }

    async fn retain(&self, firewall: &StratusFirewall) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusFirewall::kind(&()),
                &firewall.name_any(),
                &firewall.namespace().unwrap_or_default(),
                firewall.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, firewall: &StratusFirewall) -> Result<FirewallScope, Error> {
        let namespace = firewall.namespace().unwrap_or_default();
        let (client, _) = self
            .cloud
            .client_for(&namespace, firewall.spec.credentials_ref.as_ref())
            .await?;
        Ok(FirewallScope::new(firewall, client, self))
    }

    fn close(scope: FirewallScope) -> StratusFirewall {
        scope.into_record()
    }

    async fn persist(
        &self,
        original: &StratusFirewall,
        updated: &StratusFirewall,
    ) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusFirewall
#[instrument(skip(firewall, ctx), fields(firewall = %firewall.name_any()))]
pub async fn reconcile(
    firewall: Arc<StratusFirewall>,
    ctx: Arc<FirewallContext>,
) -> Result<Action, Error> {
    run_pass(firewall, ctx).await
}

/// Requeue a failed pass after the firewall retry delay
pub fn error_policy(
    firewall: Arc<StratusFirewall>,
    error: &Error,
    ctx: Arc<FirewallContext>,
) -> Action {
    warn!(
        firewall = %firewall.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "Firewall reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.firewall))
}

fn referencing<'a, F, I>(
    firewalls: &'a [Arc<StratusFirewall>],
    namespace: &str,
    name: &str,
    refs: F,
) -> Vec<WatchRef<StratusFirewall>>
where
    F: Fn(&'a StratusFirewall) -> I,
    I: Iterator<Item = &'a ObjectRef>,
{
    firewalls
        .iter()
        .filter_map(|fw| {
            let fw_namespace = fw.metadata.namespace.as_deref()?;
            refs(fw.as_ref())
                .any(|r| r.name == name && r.namespace_or(fw_namespace) == namespace)
                .then(|| WatchRef::new(&fw.name_any()).within(fw_namespace))
        })
        .collect()
}

/// Firewalls to revisit when an AddressSet changes
pub fn firewalls_for_address_set(
    firewalls: &[Arc<StratusFirewall>],
    set: &AddressSet,
) -> Vec<WatchRef<StratusFirewall>> {
    let (Some(namespace), Some(name)) = (
        set.metadata.namespace.as_deref(),
        set.metadata.name.as_deref(),
    ) else {
        return vec![];
    };
    referencing(firewalls, namespace, name, |fw| fw.address_set_refs())
}

/// Firewalls to revisit when a FirewallRule changes
pub fn firewalls_for_rule(
    firewalls: &[Arc<StratusFirewall>],
    rule: &FirewallRule,
) -> Vec<WatchRef<StratusFirewall>> {
    let (Some(namespace), Some(name)) = (
        rule.metadata.namespace.as_deref(),
        rule.metadata.name.as_deref(),
    ) else {
        return vec![];
    };
    referencing(firewalls, namespace, name, |fw| fw.rule_refs())
}
