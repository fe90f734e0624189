//! StratusKey controller
//!
//! Issues an object storage access key and writes its material to a Secret.
//! The secret half of a key is only returned when the key is created, so a
//! key whose Secret went missing cannot be repaired in place: it is revoked
//! and issued again. Bumping `keyGeneration` rotates the key the same way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use stratus_cloud::types::{CreateKeyRequest, KeyBucketAccess, ObjectKey};
use stratus_cloud::CloudClient;
use stratus_common::credentials::opaque_secret;
use stratus_common::crd::{KeyCondition, ReconcileState, StratusKey, StratusKeyStatus};
use stratus_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use stratus_common::kube_utils::{cloud_label, has_finalizer};
use stratus_common::{CloudAccess, ControllerConfig, Error, StageTimings, STRATUS_FINALIZER};
use stratus_engine::{
    retry_delay, run_pass, Driver, Stage, StageFuture, StagePlan, Staged, Teardown,
};
use tracing::{debug, info, instrument, warn};

use crate::store::{KeyStore, KubeStorageStore};

/// Metrics and log label of this controller
pub const KIND: &str = "key";

/// Secret entry holding the access key ID
pub const ACCESS_KEY_ENTRY: &str = "access_key";

/// Secret entry holding the secret key
pub const SECRET_KEY_ENTRY: &str = "secret_key";

/// Shared state of the key controller
pub struct KeyContext {
    pub store: Arc<dyn KeyStore>,
    pub cloud: CloudAccess,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
}

impl KeyContext {
    pub fn new(client: Client, cloud: CloudAccess, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeStorageStore::new(client.clone())),
            cloud,
            events: Arc::new(KubeEventPublisher::new(client, "stratus-key-controller")),
            config,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn KeyStore>,
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

/// Working copy of one key for the duration of a pass
pub struct KeyScope {
    record: StratusKey,
    status: StratusKeyStatus,
    cloud: Arc<dyn CloudClient>,
    ctx: Arc<KeyContext>,
    /// Material of a key issued during this pass
    issued: Option<IssuedKey>,
}

struct IssuedKey {
    access_key: String,
    secret_key: String,
}

impl KeyScope {
    fn new(key: &StratusKey, cloud: Arc<dyn CloudClient>, ctx: Arc<KeyContext>) -> Self {
        let mut record = key.clone();
        let status = record.status.take().unwrap_or_default();
        Self {
            record,
            status,
            cloud,
            ctx,
            issued: None,
        }
    }

    fn into_record(self) -> StratusKey {
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

    fn secret_name(&self) -> String {
        self.status
            .secret_name
            .clone()
            .unwrap_or_else(|| self.record.secret_name())
    }

    fn needs_rotation(&self) -> bool {
        self.status
            .last_key_generation
            .is_some_and(|g| g != self.record.spec.key_generation)
    }

    fn grants(&self) -> Vec<KeyBucketAccess> {
        self.record
            .spec
            .bucket_access
            .iter()
            .map(|g| KeyBucketAccess {
                bucket_name: g.bucket_name.clone(),
                region: g.region.clone(),
                permissions: g.permissions.as_str().to_string(),
            })
            .collect()
    }

    async fn secret_exists(&self) -> Result<bool, Error> {
        let secret = self
            .ctx
            .cloud
            .secrets()
            .get_secret(&self.namespace(), &self.secret_name())
            .await?;
        Ok(secret.is_some())
    }

    /// Delete the issued key and forget everything derived from it
    async fn revoke(&mut self) -> Result<(), Error> {
        if let Some(id) = self.status.key_id {
            match self.cloud.delete_key(id).await {
                Ok(()) => info!(key = id, "Revoked key"),
                Err(e) if e.is_not_found() => debug!(key = id, "Key already gone"),
                Err(e) => return Err(e.into()),
            }
        }
        self.status.key_id = None;
        self.status.access_key_id = None;
        self.status.state.conditions.remove(KeyCondition::KeyCreated);
        self.status.state.conditions.remove(KeyCondition::SecretWritten);
        self.status.state.ready = false;
        Ok(())
    }

    /// Revoke the issued key when a new generation was requested, or when
    /// its Secret is gone and the material cannot be recovered
    async fn replace_stale_key(&mut self) -> Result<(), Error> {
        let note = if self.needs_rotation() {
            format!(
                "rotating key for generation {}",
                self.record.spec.key_generation
            )
        } else if self.status.key_id.is_some() && !self.secret_exists().await? {
            format!("secret {} is missing, issuing a new key", self.secret_name())
        } else {
            return Ok(());
        };

        info!(reason = %note, "Replacing key");
        self.revoke().await?;
        self.ctx
            .events
            .publish(
                &self.record.object_ref(&()),
                EventType::Normal,
                reasons::KEY_ROTATED,
                actions::ROTATE,
                Some(note),
            )
            .await;
        Ok(())
    }

    fn record_issued(&mut self, key: ObjectKey) -> Result<(), Error> {
        let secret_key = key.secret_key.ok_or_else(|| {
            Error::internal_with_context("create_key", "response carried no secret key")
        })?;
        self.status.key_id = Some(key.id);
        self.status.access_key_id = Some(key.access_key.clone());
        self.status.last_key_generation = Some(self.record.spec.key_generation);
        self.status.creation_time = Some(Utc::now().to_rfc3339());
        self.issued = Some(IssuedKey {
            access_key: key.access_key,
            secret_key,
        });
        Ok(())
    }
}

impl Staged for KeyScope {
    type Condition = KeyCondition;
    const KIND: &'static str = KIND;

    fn state(&self) -> &ReconcileState<KeyCondition> {
        &self.status.state
    }

    fn state_mut(&mut self) -> &mut ReconcileState<KeyCondition> {
        &mut self.status.state
    }
}

fn refresh_key(scope: &mut KeyScope) -> StageFuture<'_> {
    Box::pin(async move { scope.replace_stale_key().await })
}

fn create_key(scope: &mut KeyScope) -> StageFuture<'_> {
    Box::pin(async move {
        if let Some(id) = scope.status.key_id {
            match scope.cloud.get_key(id).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    info!(key = id, "Recorded key no longer exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let request = CreateKeyRequest {
            label: cloud_label(&scope.namespace(), &scope.name()),
            bucket_access: scope.grants(),
        };
        let key = scope.cloud.create_key(&request).await?;
        info!(key = key.id, buckets = request.bucket_access.len(), "Issued key");
        scope.record_issued(key)
    })
}

fn write_secret(scope: &mut KeyScope) -> StageFuture<'_> {
    Box::pin(async move {
        let name = scope.secret_name();
        let Some(issued) = scope.issued.as_ref() else {
            if scope.secret_exists().await? {
                scope.status.secret_name = Some(name);
                return Ok(());
            }
            return Err(Error::internal_with_context(
                "write_secret",
                "key material is no longer available",
            ));
        };

        let values = BTreeMap::from([
            (ACCESS_KEY_ENTRY.to_string(), issued.access_key.clone()),
            (SECRET_KEY_ENTRY.to_string(), issued.secret_key.clone()),
        ]);
        let secret = opaque_secret(&scope.namespace(), &name, values);
        scope.ctx.cloud.secrets().apply_secret(&secret).await?;
        info!(secret = %name, "Wrote key secret");
        scope.status.secret_name = Some(name);
        Ok(())
    })
}

/// Stage plan of a StratusKey
pub fn key_plan() -> Result<StagePlan<KeyScope>, Error> {
    use KeyCondition::*;
    Ok(StagePlan::new(vec![
        Stage::every_pass(KeyCurrent, "KeyCurrent", refresh_key),
        Stage::once(KeyCreated, "KeyIssued", create_key).requires(&[KeyCurrent]),
        Stage::once(SecretWritten, "SecretStored", write_secret).requires(&[KeyCreated]),
    ])?)
}

#[async_trait]
impl Teardown for KeyScope {
    fn has_finalizer(&self) -> bool {
        has_finalizer(&self.record, STRATUS_FINALIZER)
    }

    fn deletion_requested_at(&self) -> Option<DateTime<Utc>> {
        self.record.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    async fn teardown(&mut self) -> Result<(), Error> {
        let Some(id) = self.status.key_id else {
            debug!("No key was ever issued");
            return Ok(());
        };
        info!(key = id, "Deleting key");
        self.cloud.delete_key(id).await?;
        Ok(())
    }

    async fn release_auxiliary(&mut self) -> Result<(), Error> {
        let namespace = self.namespace();
        self.ctx
            .cloud
            .secrets()
            .delete_secret(&namespace, &self.secret_name())
            .await?;
        self.ctx
            .cloud
            .release(
                &StratusKey::kind(&()),
                &self.name(),
                &namespace,
                self.record.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn release_finalizer(&mut self) -> Result<(), Error> {
        self.ctx.store.remove_finalizer(&self.record).await
    }
}

#[async_trait]
impl Driver for KeyContext {
    type Record = StratusKey;
    type Scope = KeyScope;

    fn timings(&self) -> &StageTimings {
        &self.config.key
    }

    fn resync_interval(&self) -> Duration {
        self.config.resync_interval
    }

    fn events(&self) -> &dyn EventPublisher {
        self.events.as_ref()
    }

    fn plan(&self) -> Result<StagePlan<KeyScope>, Error> {
        key_plan()
    }

    fn state_of(key: &mut StratusKey) -> &mut ReconcileState<KeyCondition> {
        &mut key.status.get_or_insert_with(Default::default).state
    }

    async fn add_finalizer(&self, key: &StratusKey) -> Result<(), Error> {
        self.store.add_finalizer(key).await
    }

    async fn retain(&self, key: &StratusKey) -> Result<(), Error> {
        self.cloud
            .retain(
                &StratusKey::kind(&()),
                &key.name_any(),
                &key.namespace().unwrap_or_default(),
                key.spec.credentials_ref.as_ref(),
            )
            .await
    }

    async fn open(self: Arc<Self>, key: &StratusKey) -> Result<KeyScope, Error> {
        let namespace = key.namespace().unwrap_or_default();
        let (client, _) = self
            .cloud
            .client_for(&namespace, key.spec.credentials_ref.as_ref())
            .await?;
        Ok(KeyScope::new(key, client, self))
    }

    fn close(scope: KeyScope) -> StratusKey {
        scope.into_record()
    }

    async fn persist(&self, original: &StratusKey, updated: &StratusKey) -> Result<(), Error> {
        self.store.persist(original, updated).await
    }
}

/// Reconcile a StratusKey
#[instrument(skip(key, ctx), fields(key = %key.name_any()))]
pub async fn reconcile(key: Arc<StratusKey>, ctx: Arc<KeyContext>) -> Result<Action, Error> {
    run_pass(key, ctx).await
}

/// Requeue a failed pass after the key retry delay
pub fn error_policy(key: Arc<StratusKey>, error: &Error, ctx: Arc<KeyContext>) -> Action {
    warn!(
        key = %key.name_any(),
        error = %error,
        retryable = error.is_retryable(),
        "Key reconcile failed"
    );
    Action::requeue(retry_delay(error, &ctx.config.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockKeyStore;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::predicate::eq;
    use stratus_cloud::{CloudError, Credentials, MockCloudClient, MockCloudConnector};
    use stratus_common::credentials::secret_value;
    use stratus_common::crd::{
        BucketAccessGrant, ConditionStatus, GeneratedSecret, KeyPermissions, StratusKeySpec,
    };
    use stratus_common::MockSecretStore;

    fn key() -> StratusKey {
        let mut key = StratusKey::new(
            "backup",
            StratusKeySpec {
                bucket_access: vec![BucketAccessGrant {
                    bucket_name: "etcd-backups".into(),
                    region: "us-ord".into(),
                    permissions: KeyPermissions::ReadWrite,
                }],
                key_generation: 0,
                generated_secret: GeneratedSecret::default(),
                credentials_ref: None,
            },
        );
        key.metadata.namespace = Some("default".into());
        key.metadata.finalizers = Some(vec![STRATUS_FINALIZER.to_string()]);
        key
    }

    /// A key issued for generation 0 whose secret was written
    fn issued_key() -> StratusKey {
        let mut key = key();
        let mut status = StratusKeyStatus {
            key_id: Some(7),
            access_key_id: Some("AKOLD".into()),
            last_key_generation: Some(0),
            secret_name: Some("backup-obj-key".into()),
            ..Default::default()
        };
        let now = Utc::now();
        status
            .state
            .conditions
            .set_true(KeyCondition::KeyCreated, "KeyIssued", now);
        status
            .state
            .conditions
            .set_true(KeyCondition::SecretWritten, "SecretStored", now);
        status.state.ready = true;
        key.status = Some(status);
        key
    }

    fn cloud_key(id: u64, access_key: &str) -> ObjectKey {
        ObjectKey {
            id,
            label: "default-backup".into(),
            access_key: access_key.into(),
            secret_key: Some(format!("{}-secret", access_key)),
            bucket_access: vec![],
        }
    }

    fn context(
        store: MockKeyStore,
        client: MockCloudClient,
        secrets: MockSecretStore,
    ) -> Arc<KeyContext> {
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
        Arc::new(KeyContext::for_testing(
            Arc::new(store),
            cloud,
            ControllerConfig::default(),
        ))
    }

    fn written(access_key: &'static str) -> impl Fn(&Secret) -> bool {
        move |secret: &Secret| {
            secret.metadata.name.as_deref() == Some("backup-obj-key")
                && secret_value(secret, ACCESS_KEY_ENTRY).as_deref() == Some(access_key)
                && secret_value(secret, SECRET_KEY_ENTRY).is_some()
        }
    }

    #[tokio::test]
    async fn story_new_key_is_issued_and_written_to_a_secret() {
        let mut client = MockCloudClient::new();
        client
            .expect_create_key()
            .withf(|req| {
                req.label == "default-backup"
                    && req.bucket_access[0].permissions == "read_write"
                    && req.bucket_access[0].bucket_name == "etcd-backups"
            })
            .times(1)
            .returning(|_| Ok(cloud_key(7, "AKNEW")));

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_apply_secret()
            .withf(written("AKNEW"))
            .times(1)
            .returning(|_| Ok(()));

        let mut store = MockKeyStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let status = updated.status.as_ref().unwrap();
                status.state.ready
                    && status.key_id == Some(7)
                    && status.access_key_id.as_deref() == Some("AKNEW")
                    && status.last_key_generation == Some(0)
                    && status.secret_name.as_deref() == Some("backup-obj-key")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(key()), context(store, client, secrets))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_bumped_generation_rotates_the_key() {
        let mut rotated = issued_key();
        rotated.spec.key_generation = 1;

        let mut client = MockCloudClient::new();
        client
            .expect_delete_key()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_create_key()
            .times(1)
            .returning(|_| Ok(cloud_key(8, "AKROTATED")));

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_apply_secret()
            .withf(written("AKROTATED"))
            .times(1)
            .returning(|_| Ok(()));

        let mut store = MockKeyStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let status = updated.status.as_ref().unwrap();
                status.key_id == Some(8) && status.last_key_generation == Some(1)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(rotated), context(store, client, secrets))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_missing_secret_reissues_the_key() {
        let mut client = MockCloudClient::new();
        client
            .expect_delete_key()
            .with(eq(7))
            .times(1)
            .returning(|_| Err(CloudError::not_found("object-storage/keys/7")));
        client
            .expect_create_key()
            .times(1)
            .returning(|_| Ok(cloud_key(9, "AKRECOVERED")));

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_get_secret()
            .with(eq("default"), eq("backup-obj-key"))
            .returning(|_, _| Ok(None));
        secrets
            .expect_apply_secret()
            .withf(written("AKRECOVERED"))
            .times(1)
            .returning(|_| Ok(()));

        let mut store = MockKeyStore::new();
        store
            .expect_persist()
            .withf(|_, updated| updated.status.as_ref().unwrap().key_id == Some(9))
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(Arc::new(issued_key()), context(store, client, secrets))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_refused_revocation_replaces_old_failure_with_the_real_one() {
        let mut rotated = issued_key();
        rotated.spec.key_generation = 1;
        if let Some(status) = rotated.status.as_mut() {
            status.state.set_failure("OldReason", "stale text");
        }

        let mut client = MockCloudClient::new();
        client
            .expect_delete_key()
            .with(eq(7))
            .times(1)
            .returning(|_| Err(CloudError::api(403, "forbidden")));
        client.expect_create_key().never();

        let mut store = MockKeyStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let state = &updated.status.as_ref().unwrap().state;
                let current = state.conditions.get(KeyCondition::KeyCurrent).unwrap();
                state.failure_reason.as_deref() == Some("CloudApiError")
                    && state.failure_message.as_deref() != Some("stale text")
                    && current.status == ConditionStatus::False
                    && !state.ready
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let err = reconcile(
            Arc::new(rotated),
            context(store, client, MockSecretStore::new()),
        )
        .await
        .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.failure_reason(), "CloudApiError");
    }

    #[tokio::test]
    async fn story_missing_credentials_are_recorded_on_the_key() {
        let mut connector = MockCloudConnector::new();
        connector.expect_connect().never();
        let cloud = CloudAccess::new(Arc::new(connector), Arc::new(MockSecretStore::new()), None);

        let mut store = MockKeyStore::new();
        store
            .expect_persist()
            .withf(|_, updated| {
                let state = &updated.status.as_ref().unwrap().state;
                state.failure_reason.as_deref() == Some("InvalidConfiguration")
                    && state
                        .conditions
                        .get(KeyCondition::Ready)
                        .is_some_and(|c| c.status == ConditionStatus::False)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = Arc::new(KeyContext::for_testing(
            Arc::new(store),
            cloud,
            ControllerConfig::default(),
        ));

        let err = reconcile(Arc::new(key()), ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn story_settled_key_is_left_alone() {
        let mut client = MockCloudClient::new();
        client.expect_create_key().never();
        client.expect_delete_key().never();

        let mut secrets = MockSecretStore::new();
        secrets.expect_get_secret().returning(|ns, name| {
            let values = BTreeMap::from([(ACCESS_KEY_ENTRY.to_string(), "AKOLD".to_string())]);
            Ok(Some(opaque_secret(ns, name, values)))
        });
        secrets.expect_apply_secret().never();

        let mut store = MockKeyStore::new();
        store.expect_persist().returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(issued_key()), context(store, client, secrets))
            .await
            .unwrap();
        assert_eq!(
            action,
            Action::requeue(ControllerConfig::default().resync_interval)
        );
    }

    #[tokio::test]
    async fn story_deletion_revokes_key_and_removes_secret() {
        let mut deleting = issued_key();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut client = MockCloudClient::new();
        client
            .expect_delete_key()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_delete_secret()
            .with(eq("default"), eq("backup-obj-key"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut store = MockKeyStore::new();
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleting), context(store, client, secrets))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_first_pass_adds_finalizer() {
        let mut fresh = key();
        fresh.metadata.finalizers = None;

        let mut store = MockKeyStore::new();
        store.expect_add_finalizer().times(1).returning(|_| Ok(()));
        store.expect_persist().never();

        let action = reconcile(
            Arc::new(fresh),
            context(store, MockCloudClient::new(), MockSecretStore::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[test]
    fn plan_is_valid() {
        assert_eq!(key_plan().unwrap().len(), 3);
    }
}
