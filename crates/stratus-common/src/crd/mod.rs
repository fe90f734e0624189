//! Custom resource definitions for the infrastructure.stratus.dev API group

mod cluster;
mod machine;
mod network;
mod storage;
mod types;

use kube::CustomResourceExt;

pub use cluster::{
    ApiEndpoint, ClusterCondition, ClusterNetwork, LoadBalancerPort, StratusCluster,
    StratusClusterSpec, StratusClusterStatus, DEFAULT_API_SERVER_PORT,
};
pub use machine::{
    MachineAddress, MachineAddressType, MachineCondition, StratusMachine, StratusMachineSpec,
    StratusMachineStatus, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL,
};
pub use network::{
    AddressSet, AddressSetSpec, FirewallAction, FirewallCondition, FirewallProtocol, FirewallRule,
    FirewallRuleSpec, RuleAddresses, StratusFirewall, StratusFirewallSpec, StratusFirewallStatus,
    StratusVpc, StratusVpcSpec, StratusVpcStatus, VpcCondition, VpcSubnet,
};
pub use storage::{
    BucketAccessGrant, BucketAcl, BucketCondition, GeneratedSecret, KeyCondition, KeyPermissions,
    StratusBucket, StratusBucketSpec, StratusBucketStatus, StratusKey, StratusKeySpec,
    StratusKeyStatus,
};
pub use types::{
    Condition, ConditionStatus, ConditionType, Conditions, ObjectRef, ReconcileState, SecretRef,
};

/// Every CRD this operator serves, for installation
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        StratusCluster::crd(),
        StratusMachine::crd(),
        StratusVpc::crd(),
        StratusFirewall::crd(),
        FirewallRule::crd(),
        AddressSet::crd(),
        StratusBucket::crd(),
        StratusKey::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_crd_is_unique_and_in_group() {
        let crds = all_crds();
        let mut names: Vec<_> = crds
            .iter()
            .map(|c| c.metadata.name.clone().unwrap_or_default())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), crds.len());
        assert!(crds
            .iter()
            .all(|c| c.spec.group == "infrastructure.stratus.dev"));
    }
}
