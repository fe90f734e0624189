//! Network resources: VPCs, firewalls and the rule objects firewalls reference

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionType, ObjectRef, ReconcileState, SecretRef};

// =============================================================================
// StratusVpc
// =============================================================================

/// Specification for a StratusVpc
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusVpc",
    namespaced,
    status = "StratusVpcStatus",
    shortname = "svpc",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"VPC","type":"string","jsonPath":".spec.vpcId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusVpcSpec {
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub subnets: Vec<VpcSubnet>,

    /// VPC ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
}

/// A subnet inside a VPC
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpcSubnet {
    pub label: String,

    /// IPv4 range in CIDR form; the cloud picks one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// Subnet ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<u64>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum VpcCondition {
    VpcCreated,
    SubnetsReconciled,
    Ready,
}

impl ConditionType for VpcCondition {
    const READY: Self = VpcCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            VpcCondition::VpcCreated => "VpcCreated",
            VpcCondition::SubnetsReconciled => "SubnetsReconciled",
            VpcCondition::Ready => "Ready",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusVpcStatus {
    #[serde(flatten)]
    pub state: ReconcileState<VpcCondition>,
}

impl StratusVpc {
    /// First subnet that has been created, used for instance interfaces
    pub fn first_subnet_id(&self) -> Option<u64> {
        self.spec.subnets.iter().find_map(|s| s.subnet_id)
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state.ready)
    }
}

// =============================================================================
// Firewall rules
// =============================================================================

/// What a firewall does with matching traffic
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallAction {
    #[default]
    Accept,
    Drop,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Accept => "ACCEPT",
            FirewallAction::Drop => "DROP",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FirewallProtocol {
    Tcp,
    Udp,
    Icmp,
    Ipencap,
}

impl FirewallProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallProtocol::Tcp => "TCP",
            FirewallProtocol::Udp => "UDP",
            FirewallProtocol::Icmp => "ICMP",
            FirewallProtocol::Ipencap => "IPENCAP",
        }
    }
}

/// Inline addresses of a rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RuleAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Vec<String>>,
}

/// One declarative firewall rule.
///
/// Used inline in a StratusFirewall and as the spec of standalone
/// FirewallRule objects that firewalls reference.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "FirewallRule",
    namespaced,
    shortname = "sfwr"
)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRuleSpec {
    pub action: FirewallAction,

    pub label: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Port list or range, e.g. "22" or "80,443" or "30000-32767"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,

    pub protocol: FirewallProtocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<RuleAddresses>,

    /// AddressSets whose addresses are added to this rule
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address_set_refs: Vec<ObjectRef>,
}

/// A named, reusable list of addresses
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "AddressSet",
    namespaced,
    shortname = "saddr"
)]
#[serde(rename_all = "camelCase")]
pub struct AddressSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Vec<String>>,
}

// =============================================================================
// StratusFirewall
// =============================================================================

fn default_enabled() -> bool {
    true
}

/// Specification for a StratusFirewall
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.stratus.dev",
    version = "v1alpha1",
    kind = "StratusFirewall",
    namespaced,
    status = "StratusFirewallStatus",
    shortname = "sfw",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Firewall","type":"string","jsonPath":".spec.firewallId"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusFirewallSpec {
    /// Firewall ID, set after creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_id: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound_rules: Vec<FirewallRuleSpec>,

    /// FirewallRule objects appended after the inline inbound rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound_rule_refs: Vec<ObjectRef>,

    /// ACCEPT when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_policy: Option<FirewallAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_rules: Vec<FirewallRuleSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_rule_refs: Vec<ObjectRef>,

    /// ACCEPT when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_policy: Option<FirewallAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum FirewallCondition {
    FirewallCreated,
    RulesApplied,
    Ready,
}

impl ConditionType for FirewallCondition {
    const READY: Self = FirewallCondition::Ready;

    fn as_str(&self) -> &'static str {
        match self {
            FirewallCondition::FirewallCreated => "FirewallCreated",
            FirewallCondition::RulesApplied => "RulesApplied",
            FirewallCondition::Ready => "Ready",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusFirewallStatus {
    #[serde(flatten)]
    pub state: ReconcileState<FirewallCondition>,
}

impl StratusFirewall {
    /// Every AddressSet referenced by inline rules
    pub fn address_set_refs(&self) -> impl Iterator<Item = &ObjectRef> {
        self.spec
            .inbound_rules
            .iter()
            .chain(self.spec.outbound_rules.iter())
            .flat_map(|r| r.address_set_refs.iter())
    }

    /// Every FirewallRule object referenced by this firewall
    pub fn rule_refs(&self) -> impl Iterator<Item = &ObjectRef> {
        self.spec
            .inbound_rule_refs
            .iter()
            .chain(self.spec.outbound_rule_refs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_defaults_to_enabled_with_no_rules() {
        let spec: StratusFirewallSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(spec.enabled);
        assert!(spec.inbound_rules.is_empty());
        assert!(spec.inbound_policy.is_none());
    }

    #[test]
    fn rule_enums_use_api_spelling() {
        let rule: FirewallRuleSpec = serde_json::from_value(serde_json::json!({
            "action": "DROP",
            "label": "block-ssh",
            "ports": "22",
            "protocol": "TCP",
            "addresses": {"ipv4": ["0.0.0.0/0"]}
        }))
        .unwrap();
        assert_eq!(rule.action, FirewallAction::Drop);
        assert_eq!(rule.protocol.as_str(), "TCP");
        assert_eq!(serde_json::to_value(rule.action).unwrap(), "DROP");
    }

    #[test]
    fn first_created_subnet_is_used_for_interfaces() {
        let vpc = StratusVpc::new(
            "net",
            StratusVpcSpec {
                region: "us-ord".into(),
                description: None,
                subnets: vec![
                    VpcSubnet {
                        label: "pending".into(),
                        ipv4: None,
                        subnet_id: None,
                    },
                    VpcSubnet {
                        label: "nodes".into(),
                        ipv4: Some("10.0.0.0/24".into()),
                        subnet_id: Some(77),
                    },
                ],
                vpc_id: Some(5),
                credentials_ref: None,
            },
        );
        assert_eq!(vpc.first_subnet_id(), Some(77));
        assert!(!vpc.is_ready());
    }

    #[test]
    fn firewall_collects_references() {
        let mut fw = StratusFirewall::new(
            "fw",
            serde_json::from_value(serde_json::json!({
                "inboundRules": [{
                    "action": "ACCEPT", "label": "api", "protocol": "TCP",
                    "addressSetRefs": [{"name": "office"}]
                }],
                "outboundRuleRefs": [{"name": "egress"}]
            }))
            .unwrap(),
        );
        fw.metadata.namespace = Some("default".into());
        let sets: Vec<_> = fw.address_set_refs().map(|r| r.name.as_str()).collect();
        let rules: Vec<_> = fw.rule_refs().map(|r| r.name.as_str()).collect();
        assert_eq!(sets, vec!["office"]);
        assert_eq!(rules, vec!["egress"]);
    }
}
