//! Builds the controller futures the operator runs
//!
//! Each `build_*` function returns boxed futures the caller joins, so
//! controller wiring stays separate from process setup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerSettings;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use stratus_cloud::LimiterRegistry;
use stratus_cluster::{cluster_for_machine, Context as ClusterContext};
use stratus_common::crd::{
    AddressSet, FirewallRule, StratusBucket, StratusCluster, StratusFirewall, StratusKey,
    StratusMachine, StratusVpc,
};
use stratus_common::{CloudAccess, ControllerConfig};
use stratus_machine::Context as MachineContext;
use stratus_network::{firewall, vpc, FirewallContext, VpcContext};
use stratus_storage::{bucket, buckets_for_key, key, BucketContext, KeyContext};

/// Watcher timeout (seconds), kept below the client read timeout (30s) so
/// the API server closes idle watches first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be joined
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the controllers share
#[derive(Clone)]
pub struct Shared {
    pub client: Client,
    pub cloud: CloudAccess,
    pub limiters: Arc<LimiterRegistry>,
    pub config: ControllerConfig,
    pub concurrency: u16,
}

impl Shared {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings::default().concurrency(self.concurrency)
    }
}

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// StratusCluster, requeued when one of its machines changes
pub fn build_cluster_controllers(shared: &Shared) -> Vec<ControllerFuture> {
    let ctx = Arc::new(ClusterContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.config.clone(),
    ));
    let clusters: Api<StratusCluster> = Api::all(shared.client.clone());
    let machines: Api<StratusMachine> = Api::all(shared.client.clone());

    tracing::info!("- StratusCluster controller");

    vec![Box::pin(
        Controller::new(clusters, watcher())
            .with_config(shared.settings())
            .watches(machines, watcher(), |machine| cluster_for_machine(&machine))
            .shutdown_on_signal()
            .run(stratus_cluster::reconcile, stratus_cluster::error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    )]
}

/// StratusMachine; its context shares the limiter registry with the HTTP connector
pub fn build_machine_controllers(shared: &Shared) -> Vec<ControllerFuture> {
    let ctx = Arc::new(MachineContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.limiters.clone(),
        shared.config.clone(),
    ));
    let machines: Api<StratusMachine> = Api::all(shared.client.clone());

    tracing::info!("- StratusMachine controller");

    vec![Box::pin(
        Controller::new(machines, watcher())
            .with_config(shared.settings())
            .shutdown_on_signal()
            .run(stratus_machine::reconcile, stratus_machine::error_policy, ctx)
            .for_each(log_reconcile_result("Machine")),
    )]
}

/// StratusVpc and StratusFirewall. Firewalls are requeued when an AddressSet
/// or FirewallRule they reference changes.
pub fn build_network_controllers(shared: &Shared) -> Vec<ControllerFuture> {
    let vpc_ctx = Arc::new(VpcContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.config.clone(),
    ));
    let vpcs: Api<StratusVpc> = Api::all(shared.client.clone());
    let vpc_ctrl = Controller::new(vpcs, watcher())
        .with_config(shared.settings())
        .shutdown_on_signal()
        .run(vpc::reconcile, vpc::error_policy, vpc_ctx)
        .for_each(log_reconcile_result("Vpc"));

    let firewall_ctx = Arc::new(FirewallContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.config.clone(),
    ));
    let firewalls: Api<StratusFirewall> = Api::all(shared.client.clone());
    let address_sets: Api<AddressSet> = Api::all(shared.client.clone());
    let rules: Api<FirewallRule> = Api::all(shared.client.clone());

    let controller = Controller::new(firewalls, watcher()).with_config(shared.settings());
    let by_set = controller.store();
    let by_rule = controller.store();
    let firewall_ctrl = controller
        .watches(address_sets, watcher(), move |set| {
            firewall::firewalls_for_address_set(&by_set.state(), &set)
        })
        .watches(rules, watcher(), move |rule| {
            firewall::firewalls_for_rule(&by_rule.state(), &rule)
        })
        .shutdown_on_signal()
        .run(firewall::reconcile, firewall::error_policy, firewall_ctx)
        .for_each(log_reconcile_result("Firewall"));

    tracing::info!("- StratusVpc controller");
    tracing::info!("- StratusFirewall controller");

    vec![Box::pin(vpc_ctrl), Box::pin(firewall_ctrl)]
}

/// StratusBucket and StratusKey. Buckets are requeued when a key granting
/// access to them changes, so a blocked deletion proceeds once the key is gone.
pub fn build_storage_controllers(shared: &Shared) -> Vec<ControllerFuture> {
    let bucket_ctx = Arc::new(BucketContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.config.clone(),
    ));
    let buckets: Api<StratusBucket> = Api::all(shared.client.clone());
    let granting: Api<StratusKey> = Api::all(shared.client.clone());
    let bucket_ctrl = Controller::new(buckets, watcher())
        .with_config(shared.settings())
        .watches(granting, watcher(), |key| buckets_for_key(&key))
        .shutdown_on_signal()
        .run(bucket::reconcile, bucket::error_policy, bucket_ctx)
        .for_each(log_reconcile_result("Bucket"));

    let key_ctx = Arc::new(KeyContext::new(
        shared.client.clone(),
        shared.cloud.clone(),
        shared.config.clone(),
    ));
    let keys: Api<StratusKey> = Api::all(shared.client.clone());
    let key_ctrl = Controller::new(keys, watcher())
        .with_config(shared.settings())
        .shutdown_on_signal()
        .run(key::reconcile, key::error_policy, key_ctx)
        .for_each(log_reconcile_result("Key"));

    tracing::info!("- StratusBucket controller");
    tracing::info!("- StratusKey controller");

    vec![Box::pin(bucket_ctrl), Box::pin(key_ctrl)]
}

/// Every controller the operator runs
pub fn build_all(shared: &Shared) -> Vec<ControllerFuture> {
    let mut futures = build_cluster_controllers(shared);
    futures.extend(build_machine_controllers(shared));
    futures.extend(build_network_controllers(shared));
    futures.extend(build_storage_controllers(shared));
    futures
}

/// Log the outcome of each pass a controller stream yields
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    kind: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(outcome) => tracing::debug!(kind, ?outcome, "Pass finished"),
            Err(e) => tracing::warn!(kind, error = %e, "Pass failed"),
        }
        std::future::ready(())
    }
}
