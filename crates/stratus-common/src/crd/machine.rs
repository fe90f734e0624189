//! StratusMachine: one compute instance backing a cluster node

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionType, ObjectRef, ReconcileState, SecretRef};

/// Label linking a machine to the cluster it belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Specification for a StratusMachine
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusMachine",
    namespaced,
    status = "StratusMachineStatus",
    shortname = "smach",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusMachineSpec {
    pub region: String,

    /// Instance plan, e.g. "g6-standard-2"
    pub instance_type: String,

    pub image: String,

    /// Root disk size; the image default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk_size_gb: Option<u64>,

    /// Extra disks to create, by label
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_disks: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Attach a private network address
    #[serde(default)]
    pub private_ip: bool,

    /// VPC to attach the instance to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_ref: Option<ObjectRef>,

    /// Firewall protecting the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_ref: Option<ObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,

    /// Instance ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<u64>,

    /// `stratus://<region>/<instance id>`, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,
}

/// Kind of a machine address
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    ExternalIP,
    InternalIP,
    ExternalDNS,
    InternalDNS,
    Hostname,
}

/// One address of a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    pub address: String,
}

impl MachineAddress {
    pub fn internal(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::InternalIP,
            address: address.into(),
        }
    }

    pub fn external(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::ExternalIP,
            address: address.into(),
        }
    }
}

/// Conditions reported by a StratusMachine, in stage order
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum MachineCondition {
    InstanceCreated,
    RootDiskResized,
    AdditionalDisksCreated,
    InstanceBooted,
    InstanceRunning,
    AddressesResolved,
    Ready,
}

impl ConditionType for MachineCondition {
    const READY: Self = MachineCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            MachineCondition::InstanceCreated => "InstanceCreated",
            MachineCondition::RootDiskResized => "RootDiskResized",
            MachineCondition::AdditionalDisksCreated => "AdditionalDisksCreated",
            MachineCondition::InstanceBooted => "InstanceBooted",
            MachineCondition::InstanceRunning => "InstanceRunning",
            MachineCondition::AddressesResolved => "AddressesResolved",
            MachineCondition::Ready => "Ready",
        }
    }
}

/// Status of a StratusMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusMachineStatus {
    #[serde(flatten)]
    pub state: ReconcileState<MachineCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Last instance state reported by the cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,
}

impl StratusMachine {
    /// Name of the cluster this machine belongs to
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
    }

    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL))
    }

    pub fn addresses(&self) -> &[MachineAddress] {
        self.status
            .as_ref()
            .map(|s| s.addresses.as_slice())
            .unwrap_or(&[])
    }
}
