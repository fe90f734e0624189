//! StratusCluster: the load-balanced control plane entry point of a cluster

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionType, ObjectRef, ReconcileState, SecretRef};

/// Port the API server listens on when the spec does not override it
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Specification for a StratusCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusCluster",
    namespaced,
    status = "StratusClusterStatus",
    shortname = "scl",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusClusterSpec {
    /// Region the load balancer is created in
    pub region: String,

    /// Load balancer configuration
    #[serde(default)]
    pub network: ClusterNetwork,

    /// Address clients use to reach the API server; filled in once the
    /// load balancer has an address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// VPC whose addresses the control plane machines use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_ref: Option<ObjectRef>,

    /// Secret with the API token; the operator's default token otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
}

/// Load balancer in front of the control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Load balancer ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_id: Option<u64>,

    /// API server port, 6443 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,

    /// Load balancer config ID of the API server port, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_config_id: Option<u64>,

    /// Further ports forwarded to every control plane member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_ports: Vec<LoadBalancerPort>,

    /// Prefer VPC addresses over the private network for backends
    #[serde(default)]
    pub use_vpc_backends: bool,
}

impl ClusterNetwork {
    /// The API server port with the default applied
    pub fn api_server_port(&self) -> u16 {
        self.api_server_port.unwrap_or(DEFAULT_API_SERVER_PORT)
    }
}

/// An extra port on the load balancer
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    pub port: u16,

    /// Load balancer config ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<u64>,
}

/// Host and port of the control plane
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

/// Conditions reported by a StratusCluster
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ClusterCondition {
    LoadBalancerCreated,
    LoadBalancerConfigured,
    EndpointAssigned,
    BackendsSynced,
    Ready,
}

impl ConditionType for ClusterCondition {
    const READY: Self = ClusterCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            ClusterCondition::LoadBalancerCreated => "LoadBalancerCreated",
            ClusterCondition::LoadBalancerConfigured => "LoadBalancerConfigured",
            ClusterCondition::EndpointAssigned => "EndpointAssigned",
            ClusterCondition::BackendsSynced => "BackendsSynced",
            ClusterCondition::Ready => "Ready",
        }
    }
}

/// Status of a StratusCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusClusterStatus {
    #[serde(flatten)]
    pub state: ReconcileState<ClusterCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn api_server_port_defaults_to_6443() {
        assert_eq!(ClusterNetwork::default().api_server_port(), 6443);
        let custom = ClusterNetwork {
            api_server_port: Some(443),
            ..Default::default()
        };
        assert_eq!(custom.api_server_port(), 443);
    }

    #[test]
    fn spec_parses_from_yaml_with_defaults() {
        let spec: StratusClusterSpec = serde_json::from_value(serde_json::json!({
            "region": "us-ord",
            "network": {"additionalPorts": [{"port": 8132}]}
        }))
        .unwrap();
        assert_eq!(spec.network.additional_ports[0].port, 8132);
        assert!(!spec.network.use_vpc_backends);
        assert!(spec.control_plane_endpoint.is_none());
    }

    #[test]
    fn status_flattens_reconcile_state() {
        let status = StratusClusterStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["ready"], false);
        assert!(json["conditions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn crd_has_expected_group() {
        let crd = StratusCluster::crd();
        assert_eq!(crd.spec.group, "infrastructure.stratus.dev");
        assert_eq!(crd.spec.names.kind, "StratusCluster");
    }
}
