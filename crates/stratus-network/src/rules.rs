//! Firewall rule builder
//!
//! Turns declared rules into the rule set the cloud API accepts. The API
//! caps a rule at 255 addresses and a firewall at 25 rules, so addresses are
//! normalized to CIDR form, de-duplicated and split across as many rules as
//! needed. A rule never mixes IPv4 and IPv6 addresses.

use std::collections::BTreeSet;
use std::net::IpAddr;

use stratus_cloud::types::{FirewallRule, FirewallRules, NetworkAddresses};
use stratus_common::crd::{FirewallAction, FirewallRuleSpec};
use stratus_common::Error;

/// Most addresses one cloud rule may carry
pub const MAX_ADDRESSES_PER_RULE: usize = 255;

/// Most rules one firewall may carry, inbound and outbound together
pub const MAX_RULES: usize = 25;

/// Longest rule label the API accepts
pub const MAX_LABEL_LEN: usize = 32;

/// A declared rule with its AddressSet references resolved
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRule {
    pub spec: FirewallRuleSpec,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

impl ResolvedRule {
    /// Start from the inline addresses of `spec`
    pub fn new(spec: FirewallRuleSpec) -> Self {
        let inline = spec.addresses.clone().unwrap_or_default();
        Self {
            ipv4: inline.ipv4.unwrap_or_default(),
            ipv6: inline.ipv6.unwrap_or_default(),
            spec,
        }
    }

    /// Add the addresses of one referenced AddressSet
    pub fn extend(&mut self, ipv4: &[String], ipv6: &[String]) {
        self.ipv4.extend_from_slice(ipv4);
        self.ipv6.extend_from_slice(ipv6);
    }
}

/// Every rule of a firewall, resolved, plus its declared policies
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeclaredRules {
    pub inbound: Vec<ResolvedRule>,
    pub inbound_policy: Option<FirewallAction>,
    pub outbound: Vec<ResolvedRule>,
    pub outbound_policy: Option<FirewallAction>,
}

/// CIDR form of an address. Bare addresses get a host prefix; anything with
/// a prefix already, or that does not parse, is left for the API to judge.
pub fn normalize_address(address: &str) -> String {
    if address.contains('/') {
        return address.to_string();
    }
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => format!("{}/32", address),
        Ok(IpAddr::V6(_)) => format!("{}/128", address),
        Err(_) => address.to_string(),
    }
}

fn normalized_set(addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| normalize_address(a))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn rule_label(action: FirewallAction, label: &str) -> String {
    format!("{}-{}", action.as_str(), label)
        .chars()
        .take(MAX_LABEL_LEN)
        .collect()
}

fn expand(rule: &ResolvedRule) -> Vec<FirewallRule> {
    let spec = &rule.spec;
    let label = rule_label(spec.action, &spec.label);
    let make = |index: usize, addresses: NetworkAddresses| FirewallRule {
        action: spec.action.as_str().to_string(),
        label: label.clone(),
        description: format!("Rule {}, created by stratus: {}", index, spec.label),
        ports: spec.ports.clone(),
        protocol: spec.protocol.as_str().to_string(),
        addresses,
    };

    let ipv4 = normalized_set(&rule.ipv4);
    let ipv6 = normalized_set(&rule.ipv6);
    let v4_rules = ipv4
        .chunks(MAX_ADDRESSES_PER_RULE)
        .enumerate()
        .map(|(i, chunk)| {
            make(
                i,
                NetworkAddresses {
                    ipv4: Some(chunk.to_vec()),
                    ipv6: None,
                },
            )
        });
    let v6_rules = ipv6
        .chunks(MAX_ADDRESSES_PER_RULE)
        .enumerate()
        .map(|(i, chunk)| {
            make(
                i,
                NetworkAddresses {
                    ipv4: None,
                    ipv6: Some(chunk.to_vec()),
                },
            )
        });
    v4_rules.chain(v6_rules).collect()
}

/// Build the complete rule set of a firewall.
///
/// Fails without building anything partial when the result would exceed
/// [`MAX_RULES`].
pub fn build_rules(declared: &DeclaredRules) -> Result<FirewallRules, Error> {
    let inbound: Vec<FirewallRule> = declared.inbound.iter().flat_map(expand).collect();
    let outbound: Vec<FirewallRule> = declared.outbound.iter().flat_map(expand).collect();

    let total = inbound.len() + outbound.len();
    if total > MAX_RULES {
        return Err(Error::cardinality("firewall rules", total, MAX_RULES));
    }

    Ok(FirewallRules {
        inbound,
        inbound_policy: declared.inbound_policy.unwrap_or_default().as_str().to_string(),
        outbound,
        outbound_policy: declared.outbound_policy.unwrap_or_default().as_str().to_string(),
    })
}
