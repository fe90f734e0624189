//! Kubernetes Event recording for Stratus controllers.
//!
//! Events are fire-and-forget: a failed publish is logged and otherwise
//! ignored, so it can never break a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about managed objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// The controller name is reported as the Event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reasons
pub mod reasons {
    /// Every stage of a resource has completed
    pub const READY: &str = "Ready";
    /// A reconcile ended in a terminal failure
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Remote teardown started
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// Deletion is waiting on dependents
    pub const DELETION_BLOCKED: &str = "DeletionBlocked";
    /// Remote teardown finished and the finalizer was released
    pub const DELETED: &str = "Deleted";
    /// Instance creation was deferred by the admission limiter
    pub const CREATION_THROTTLED: &str = "CreationThrottled";
    /// An access key was replaced
    pub const KEY_ROTATED: &str = "KeyRotated";
}

/// Well-known event actions
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting remote resources
    pub const DELETE: &str = "Delete";
    /// Creating remote resources
    pub const CREATE: &str = "Create";
    /// Rotating credentials
    pub const ROTATE: &str = "Rotate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reasons_are_pascal_case() {
        for reason in [
            reasons::READY,
            reasons::RECONCILE_FAILED,
            reasons::DELETION_BLOCKED,
            reasons::CREATION_THROTTLED,
        ] {
            assert!(reason.chars().next().unwrap().is_ascii_uppercase());
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
