//! The operations controllers perform against the cloud API

use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credentials;
use crate::error::CloudError;
use crate::types::*;

/// Result alias for cloud calls
pub type CloudResult<T> = Result<T, CloudError>;

/// Remote resource client.
///
/// Every method maps to a single API request (or a paginated series of
/// them). Deletion of an object that no longer exists surfaces as
/// [`CloudError::NotFound`]; callers that treat absence as success check
/// for it explicitly.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    // Instances
    async fn create_instance(&self, request: &CreateInstanceRequest) -> CloudResult<Instance>;
    async fn get_instance(&self, id: CloudId) -> CloudResult<Instance>;
    /// Look up an instance by its unique label
    async fn find_instance(&self, label: &str) -> CloudResult<Option<Instance>>;
    async fn boot_instance(&self, id: CloudId) -> CloudResult<()>;
    async fn delete_instance(&self, id: CloudId) -> CloudResult<()>;
    async fn list_instance_disks(&self, id: CloudId) -> CloudResult<Vec<Disk>>;
    async fn resize_disk(&self, instance: CloudId, disk: CloudId, size_mb: u64) -> CloudResult<()>;
    async fn create_disk(&self, instance: CloudId, request: &CreateDiskRequest) -> CloudResult<Disk>;
    async fn get_instance_ips(&self, id: CloudId) -> CloudResult<InstanceIps>;

    // Load balancers
    async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> CloudResult<LoadBalancer>;
    async fn get_load_balancer(&self, id: CloudId) -> CloudResult<LoadBalancer>;
    async fn find_load_balancer(&self, label: &str) -> CloudResult<Option<LoadBalancer>>;
    async fn delete_load_balancer(&self, id: CloudId) -> CloudResult<()>;
    async fn list_load_balancer_configs(&self, id: CloudId) -> CloudResult<Vec<LoadBalancerConfig>>;
    async fn create_load_balancer_config(
        &self,
        id: CloudId,
        request: &CreateLoadBalancerConfigRequest,
    ) -> CloudResult<LoadBalancerConfig>;
    async fn list_load_balancer_nodes(
        &self,
        id: CloudId,
        config: CloudId,
    ) -> CloudResult<Vec<LoadBalancerNode>>;
    async fn create_load_balancer_node(
        &self,
        id: CloudId,
        config: CloudId,
        request: &CreateLoadBalancerNodeRequest,
    ) -> CloudResult<LoadBalancerNode>;
    async fn delete_load_balancer_node(
        &self,
        id: CloudId,
        config: CloudId,
        node: CloudId,
    ) -> CloudResult<()>;

    // VPCs
    async fn create_vpc(&self, request: &CreateVpcRequest) -> CloudResult<Vpc>;
    async fn get_vpc(&self, id: CloudId) -> CloudResult<Vpc>;
    async fn find_vpc(&self, label: &str) -> CloudResult<Option<Vpc>>;
    async fn delete_vpc(&self, id: CloudId) -> CloudResult<()>;
    async fn create_subnet(&self, vpc: CloudId, request: &CreateSubnetRequest) -> CloudResult<Subnet>;

    // Firewalls
    async fn create_firewall(&self, request: &CreateFirewallRequest) -> CloudResult<Firewall>;
    async fn get_firewall(&self, id: CloudId) -> CloudResult<Firewall>;
    async fn find_firewall(&self, label: &str) -> CloudResult<Option<Firewall>>;
    async fn set_firewall_status(&self, id: CloudId, enabled: bool) -> CloudResult<()>;
    async fn get_firewall_rules(&self, id: CloudId) -> CloudResult<FirewallRules>;
    async fn update_firewall_rules(&self, id: CloudId, rules: &FirewallRules) -> CloudResult<()>;
    async fn delete_firewall(&self, id: CloudId) -> CloudResult<()>;

    // Object storage
    async fn create_bucket(&self, request: &CreateBucketRequest) -> CloudResult<Bucket>;
    async fn get_bucket(&self, region: &str, label: &str) -> CloudResult<Bucket>;
    async fn get_bucket_access(&self, region: &str, label: &str) -> CloudResult<BucketAccess>;
    async fn update_bucket_access(
        &self,
        region: &str,
        label: &str,
        access: &BucketAccess,
    ) -> CloudResult<()>;
    async fn delete_bucket(&self, region: &str, label: &str) -> CloudResult<()>;
    async fn create_key(&self, request: &CreateKeyRequest) -> CloudResult<ObjectKey>;
    async fn get_key(&self, id: CloudId) -> CloudResult<ObjectKey>;
    async fn delete_key(&self, id: CloudId) -> CloudResult<()>;
}

/// Builds a client bound to one set of credentials
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait CloudConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Arc<dyn CloudClient>;
}
