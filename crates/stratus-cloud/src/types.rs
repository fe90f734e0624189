//! Request and response bodies of the cloud API

use serde::{Deserialize, Serialize};

/// Numeric identifier the API assigns to every object
pub type CloudId = u64;

// =============================================================================
// Instances
// =============================================================================

/// Lifecycle state reported for an instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Offline,
    Booting,
    Running,
    ShuttingDown,
    Rebooting,
    Migrating,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// API spelling of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Offline => "offline",
            InstanceStatus::Booting => "booting",
            InstanceStatus::Running => "running",
            InstanceStatus::ShuttingDown => "shutting_down",
            InstanceStatus::Rebooting => "rebooting",
            InstanceStatus::Migrating => "migrating",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Instance {
    pub id: CloudId,
    pub label: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

/// Network interface attached at creation time
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct InterfaceRequest {
    /// "public" or "vpc"
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<CloudId>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateInstanceRequest {
    pub label: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub image: String,
    pub authorized_keys: Vec<String>,
    pub tags: Vec<String>,
    pub private_ip: bool,
    /// Instances are created powered off so disks can be shaped before boot
    pub booted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_id: Option<CloudId>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Disk {
    pub id: CloudId,
    pub label: String,
    /// Size in MB
    pub size: u64,
    #[serde(default)]
    pub filesystem: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreateDiskRequest {
    pub label: String,
    pub size: u64,
    pub filesystem: String,
}

/// Every address assigned to an instance, grouped by purpose
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InstanceIps {
    #[serde(default)]
    pub public_ipv4: Vec<String>,
    #[serde(default)]
    pub private_ipv4: Vec<String>,
    #[serde(default)]
    pub vpc_ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

// =============================================================================
// Load balancers
// =============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancer {
    pub id: CloudId,
    pub label: String,
    pub region: String,
    pub hostname: Option<String>,
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateLoadBalancerRequest {
    pub label: String,
    pub region: String,
    pub tags: Vec<String>,
}

/// A listening port on a load balancer
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerConfig {
    pub id: CloudId,
    pub port: u16,
    pub protocol: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreateLoadBalancerConfigRequest {
    pub port: u16,
    pub protocol: String,
    pub check: String,
}

/// A backend behind one load balancer port
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LoadBalancerNode {
    pub id: CloudId,
    /// "ip:port"
    pub address: String,
    pub label: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreateLoadBalancerNodeRequest {
    pub address: String,
    pub label: String,
    pub mode: String,
}

// =============================================================================
// VPCs
// =============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SubnetInstance {
    pub id: CloudId,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Subnet {
    pub id: CloudId,
    pub label: String,
    pub ipv4: Option<String>,
    /// Instances with an interface in this subnet
    #[serde(default)]
    pub instances: Vec<SubnetInstance>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Vpc {
    pub id: CloudId,
    pub label: String,
    pub region: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateVpcRequest {
    pub label: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub subnets: Vec<CreateSubnetRequest>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateSubnetRequest {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
}

// =============================================================================
// Firewalls
// =============================================================================

/// Source or destination addresses of a firewall rule, in CIDR form
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FirewallRule {
    pub action: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    pub protocol: String,
    pub addresses: NetworkAddresses,
}

/// The complete rule set of a firewall; replaced as a whole on update
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FirewallRules {
    #[serde(default)]
    pub inbound: Vec<FirewallRule>,
    pub inbound_policy: String,
    #[serde(default)]
    pub outbound: Vec<FirewallRule>,
    pub outbound_policy: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Firewall {
    pub id: CloudId,
    pub label: String,
    /// "enabled" or "disabled"
    pub status: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CreateFirewallRequest {
    pub label: String,
    pub rules: FirewallRules,
    pub tags: Vec<String>,
}

// =============================================================================
// Object storage
// =============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Bucket {
    pub label: String,
    pub region: String,
    pub hostname: String,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreateBucketRequest {
    pub label: String,
    pub region: String,
    pub acl: String,
    pub cors_enabled: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BucketAccess {
    pub acl: String,
    pub cors_enabled: bool,
}

/// Grant of a key on one bucket
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyBucketAccess {
    pub bucket_name: String,
    pub region: String,
    /// "read_only" or "read_write"
    pub permissions: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ObjectKey {
    pub id: CloudId,
    pub label: String,
    pub access_key: String,
    /// Only present in the creation response
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub bucket_access: Vec<KeyBucketAccess>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CreateKeyRequest {
    pub label: String,
    pub bucket_access: Vec<KeyBucketAccess>,
}

/// One page of a list response
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub pages: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_instance_status_does_not_break_decoding() {
        let instance: Instance = serde_json::from_str(
            r#"{"id":7,"label":"cp-0","region":"us-ord","type":"g6-standard-2","status":"resizing"}"#,
        )
        .unwrap();
        assert_eq!(instance.status, InstanceStatus::Unknown);
        assert!(instance.ipv4.is_empty());
    }

    #[test]
    fn subnet_lists_attached_instances() {
        let subnet: Subnet =
            serde_json::from_str(r#"{"id":1,"label":"a","ipv4":"10.0.0.0/24","instances":[{"id":3}]}"#)
                .unwrap();
        assert_eq!(subnet.instances, vec![SubnetInstance { id: 3 }]);
    }

    #[test]
    fn empty_address_families_are_omitted() {
        let addresses = NetworkAddresses {
            ipv4: Some(vec!["10.0.0.1/32".into()]),
            ipv6: None,
        };
        let json = serde_json::to_value(&addresses).unwrap();
        assert_eq!(json, serde_json::json!({"ipv4": ["10.0.0.1/32"]}));
    }
}
