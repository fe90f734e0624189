//! StratusBucket controller
//!
//! The object name is the bucket label. A bucket is kept while any live key
//! in its namespace still grants access to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef as WatchRef;
use kube::{Client, Resource, ResourceExt};
use stratus_cloud::types::{BucketAccess, CreateBucketRequest};
use stratus_cloud::CloudClient;
use stratus_common::crd::{
    BucketCondition, ReconcileState, StratusBucket, StratusBucketStatus, StratusKey,
};
use stratus_common::events::{EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::has_finalizer;
use stratus_common::{CloudAccess, ControllerConfig, Error, StageTimings, STRATUS_FINALIZER};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{info, instrument, warn};

use crate::store::{BucketStore, KubeStorageStore};

/// Metrics and log label of this controller
pub const KIND: &str = "bucket";

/// Shared state of the bucket controller
pub struct BucketContext {
    pub store: Arc<dyn BucketStore>,
    pub cloud: CloudAccess,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl BucketContext {
    pub fn new(client: Client, cloud: CloudAccess, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeStorageStore::new(client.clone())),
            cloud,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-bucket-controller")),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn BucketStore>,
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

/// Working copy of one bucket for the duration of a pass
pub struct BucketScope {
    record: StratusBucket,
    status: StratusBucketStatus,
    cloud: Arc<dyn CloudClient>,
    ctx: Arc<BucketContext>,
}

impl BucketScope {
    fn new(bucket: &StratusBucket, cloud: Arc<dyn CloudClient>, ctx: Arc<BucketContext>) -> Self {
        let mut record = bucket.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            ctx,
        }
    }

    fn into_record(self) -> StratusBucket {
        let mut record = self.record;
        record.status = Some(self.status);
        record
    }

    fn label(&self) -> String {
        self.record.name_any()
    }

    fn namespace(&self) -> String {
        self.record.namespace().unwrap_or_default()
    }

    fn region(&self) -> &str {
        &self.record.spec.region
    }

    fn desired_access(&self) -> BucketAccess {
        BucketAccess {
            acl: self.record.spec.acl.as_str().to_string(),
            cors_enabled: self.record.spec.cors_enabled,
        }
    }
}

impl Staged for BucketScope {
    type Condition = BucketCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<BucketCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<BucketCondition> {
        &mut self.status.state
    }
}

fn create_bucket(scope: &mut BucketScope) -> StageFuture<'_> {
    Box::pin(async move {
        let label = scope.label();
        let bucket = match scope.cloud.get_bucket(scope.region(), &label).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                let access = scope.desired_access();
                let request = CreateBucketRequest {
                    label: label.clone(),
                    region: scope.region().to_string(),
                    acl: access.acl,
                    cors_enabled: access.cors_enabled,
                };
                let bucket = scope.cloud.create_bucket(&request).await?;
                info!(bucket = %bucket.label, hostname = %bucket.hostname, "Created bucket");
                bucket
            }
            Err(e) => return Err(e.into()),
        };
        scope.status.hostname = Some(bucket.hostname);
        scope.status.creation_time = bucket.created;
        Ok(())
    })
}

fn configure_access(scope: &mut BucketScope) -> StageFuture<'_> {
    Box::pin(async move {
        let label = scope.label();
        let desired = scope.desired_access();
        let current = scope.cloud.get_bucket_access(scope.region(), &label).await?;
        if current != desired {
            info!(acl = %desired.acl, cors = desired.cors_enabled, "Updating bucket access");
            scope
                .cloud
                .update_bucket_access(scope.region(), &label, &desired)
                .await?;
        }
        Ok(())
    })
}

/// Stage plan of a StratusBucket
pub fn bucket_plan() -> Result<StagePlan<BucketScope>, Error> {
    use BucketCondition::*;
    Ok(StagePlan::new(vec![
        Stage::once(BucketCreated, "BucketProvisioned", create_bucket),
        Stage::once(AccessConfigured, "AccessApplied", configure_access)
            .requires(&[BucketCreated]),
    ])?)
}

/// Keys that are not being deleted and grant access to `bucket`
pub fn granting_keys<'a>(
    keys: &'a [StratusKey],
    bucket: &'a str,
    region: &'a str,
) -> impl Iterator<Item = &'a StratusKey> + 'a {
    keys.iter().filter(move |k| {
        k.metadata.deletion_timestamp.is_none() && k.grants_access_to(bucket, region)
    })
}

#[async_trait]
impl Teardown for BucketScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn live_dependents(&mut self) -> Result<Vec<String>, Error> {
        let keys = self.ctx.store.list_keys(&self.namespace()).await?;
        let label = self.label();
        Ok(granting_keys(&keys, &label, self.region())
            .map(|k| k.name_any())
            .collect())
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let label = self.label();
        info!(bucket = %label, "Deleting bucket");
        self.cloud.delete_bucket(self.region(), &label).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        self.ctx
            .cloud
            .release(
                &StratusBucket::kind(&()),
                &self.label(),
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
impl Driver for BucketContext {
    type Record = StratusBucket;
    type Scope = BucketScope;

    fn timings(&self) -> &StageTimings {
        &self.config.bucket
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<BucketScope>, Error> {
        bucket_plan()
    }

    fn state_of(bucket: &mut StratusBucket) -> &mut ReconcileState<BucketCondition> {
        &mut bucket.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, bucket: &StratusBucket) -> Result<(), Error> {
        self.store.add_finalizer(bucket).await
    }

    async fn retain(&self, bucket: &StratusBucket) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusBucket::kind(&()),
                &bucket.name_any(),
                &bucket.namespace().unwrap_or_default(),
                bucket.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, bucket: &StratusBucket) -> Result<BucketScope, Error> {
        let namespace = bucket.namespace().unwrap_or_default();
        let (client, _) = self
            .cloud
            .client_for(&namespace, bucket.spec.credentials_ref.as_ref())
            .await?;
        Ok(BucketScope::new(bucket, client, self))
    }

    fn close(scope: BucketScope) -> StratusBucket {
        scope.into_record()
    }

    async fn persist(
        &self,
        original: &StratusBucket,
        updated: &StratusBucket,
    ) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusBucket
#[instrument(skip(bucket, ctx), fields(bucket = %bucket.name_any()))]
pub async fn reconcile(
    bucket: Arc<StratusBucket>,
    ctx: Arc<BucketContext>,
) -> Result<Action, Error> {
    run_pass(bucket, ctx).await
}

/// Requeue a failed pass after the bucket retry delay
pub fn error_policy(bucket: Arc<StratusBucket>, error: &Error, ctx: Arc<BucketContext>) -> Action {
    warn!(
        bucket = %bucket.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "Bucket reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.bucket))
}

/// Buckets to revisit when a key changes, so a blocked deletion notices
/// the key going away
pub fn buckets_for_key(key: &StratusKey) -> Vec<WatchRef<StratusBucket>> {
    let Some(namespace) = key.namespace() else {
        return vec![];
    };
    key.spec
        .bucket_access
        .iter()
        .map(|grant| WatchRef::new(&grant.bucket_name).within(&namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use stratus_cloud::types::Bucket;
    use stratus_cloud::{CloudError, Credentials, MockCloudClient, MockCloudConnector};
    use stratus_common::crd::{
        BucketAccessGrant, BucketAcl, GeneratedSecret, KeyPermissions, StratusBucketSpec,
        StratusKeySpec,
    };
    use crate::store::MockBucketStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stratus_common::credentials::{credentials_finalizer, opaque_secret, API_TOKEN_KEY};
    use stratus_common::crd::SecretRef;
    use stratus_common::MockSecretStore;

    fn bucket() -> StratusBucket {
        let mut bucket = StratusBucket::new(
            "etcd-backups",
            StratusBucketSpec {
                region: "us-ord".into(),
                acl: BucketAcl::Private,
                cors_enabled: false,
                credentials_ref: None,
            },
        );
        bucket.metadata.namespace = Some("default".into());
        bucket.metadata.finalizers = Some(vec![STRATUS_FINALIZER.to_string()]);
        bucket
    }

    fn key(name: &str, bucket: &str) -> StratusKey {
        let mut key = StratusKey::new(
            name,
            StratusKeySpec {
                bucket_access: vec![BucketAccessGrant {
                    bucket_name: bucket.into(),
                    region: "us-ord".into(),
                    permissions: KeyPermissions::ReadWrite,
                }],
                key_generation: 0,
                generated_secret: GeneratedSecret::default(),
                credentials_ref: None,
            },
        );
        key.metadata.namespace = Some("default".into());
        key
    }

    fn cloud_bucket() -> Bucket {
        Bucket {
            label: "etcd-backups".into(),
            region: "us-ord".into(),
            hostname: "etcd-backups.us-ord-1.stratus-objects.com".into(),
            created: Some("2026-01-01T00:00:00".into()),
        }
    }

    fn context(store: MockBucketStore, client: MockCloudClient) -> Arc<BucketContext> {
        context_with_secrets(store, client, MockSecretStore::new())
    }

    fn context_with_secrets(
        store: MockBucketStore,
        client: MockCloudClient,
        secrets: MockSecretStore,
    ) -> Arc<BucketContext> {
        let client: Arc<dyn CloudClient> = Arc::new(client);
        let mut connector = MockCloudConnector::new();
        connector
            .expect_connect()
            .returning(move |_| client.clone());
        let cloud = CloudAccess::new(
            Arc::new(connector),
            Arc::new(secrets),
            Some(Credentials::new("operator-token")),
        );
        Arc::new(BucketContext::for_testing(
            Arc::new(store),
            cloud,
            ControllerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn story_new_bucket_is_created_and_published() {
        let mut client = MockCloudClient::new();
        client
            .expect_get_bucket()
            .with(eq("us-ord"), eq("etcd-backups"))
            .returning(|_, _| Err(CloudError::not_found("buckets/us-ord/etcd-backups")));
        client
            .expect_create_bucket()
            .withf(|req| req.acl == "private" && !req.cors_enabled)
            .times(1)
            .returning(|_| Ok(cloud_bucket()));
        client.expect_get_bucket_access().returning(|_, _| {
            Ok(BucketAccess {
                acl: "private".into(),
                cors_enabled: false,
            })
        });
        client.expect_update_bucket_access().never();

        let mut store = MockBucketStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let status = updated.status.as_ref().unwrap();
                status.state.ready
                    && status.hostname.as_deref()
                        == Some("etcd-backups.us-ord-1.stratus-objects.com")
                    && status.creation_time.is_some()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(bucket()), context(store, client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_credentials_secret_pin_is_retried_after_a_failure() {
        let mut settled = bucket();
        settled.spec.credentials_ref = Some(SecretRef {
            name: "team-creds".into(),
            namespace: None,
        });
        let mut status = StratusBucketStatus::default();
        let now = Utc::now();
        status
            .state
            .conditions
            .set_true(BucketCondition::BucketCreated, "BucketProvisioned", now);
        status
            .state
            .conditions
            .set_true(BucketCondition::AccessConfigured, "AccessApplied", now);
        status.state.ready = true;
        settled.status = Some(status);

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_get_secret()
            .with(eq("default"), eq("team-creds"))
            .returning(|ns, name| {
                let values =
                    BTreeMap::from([(API_TOKEN_KEY.to_string(), "team-token".to_string())]);
                Ok(Some(opaque_secret(ns, name, values)))
            });
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        secrets
            .expect_add_finalizer()
            .withf(|ns, name, finalizer| {
                ns == "default"
                    && name == "team-creds"
                    && *finalizer == credentials_finalizer("StratusBucket", "etcd-backups")
            })
            .times(2)
            .returning(move |_, _, _| match seen.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Error::internal("conflict")),
                _ => Ok(()),
            });

        let mut store = MockBucketStore::new();
        store.expect_add_finalizer().never();
        store.expect_persist().times(2).returning(|_, _| Ok(()));
        let ctx = context_with_secrets(store, MockCloudClient::new(), secrets);
        let settled = Arc::new(settled);

        let action = reconcile(settled.clone(), ctx.clone()).await.unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().bucket.retry_delay)
        );

        let action = reconcile(settled, ctx).await.unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().resync_interval)
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn story_access_is_corrected() {
        let mut public = bucket();
        public.spec.acl = BucketAcl::PublicRead;
        public.spec.cors_enabled = true;

        let mut client = MockCloudClient::new();
        client.expect_get_bucket().returning(|_, _| Ok(cloud_bucket()));
        client.expect_get_bucket_access().returning(|_, _| {
            Ok(BucketAccess {
                acl: "private".into(),
                cors_enabled: false,
            })
        });
        client
            .expect_update_bucket_access()
            .withf(|_, _, access| access.acl == "public-read" && access.cors_enabled)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut store = MockBucketStore::new();
        store.expect_persist().returning(|_, _| Ok(()));

        reconcile(Arc::new(public), context(store, client))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_deletion_waits_for_granting_keys() {
        let mut deleting = bucket();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client.expect_delete_bucket().never();

        let mut store = MockBucketStore::new();
        store
            .expect_list_keys()
            .with(eq("default"))
            .returning(|_| Ok(vec![key("backup", "etcd-backups"), key("logs", "other")]));
        store.expect_remove_finalizer().never();
        store.expect_persist().times(1).returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().bucket.retry_delay)
        );
    }

    #[tokio::test]
    async fn story_keys_being_deleted_do_not_block() {
        let mut deleting = bucket();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client
            .expect_delete_bucket()
            .with(eq("us-ord"), eq("etcd-backups"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut store = MockBucketStore::new();
        store.expect_list_keys().returning(|_| {
            let mut leaving = key("backup", "etcd-backups");
            leaving.metadata.deletion_timestamp = Some(Time(Utc::now()));
            Ok(vec![leaving])
        });
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn keys_map_to_the_buckets_they_grant() {
        let targets = buckets_for_key(&key("backup", "etcd-backups"));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].name, "etcd-backups");
        assert_eq!(targets[0].namespace.as_deref(), Some("default"));
    }

    #[test]
    fn plan_is_valid() {
        assert_eq!(bucket_plan().unwrap().len(), 2);
    }
}
