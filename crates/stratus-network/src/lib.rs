//! Network controllers: StratusVpc and StratusFirewall
//!
//! The firewall controller builds its cloud rule set with [`rules`], which
//! resolves AddressSets, normalizes and de-duplicates addresses and splits
//! them across rules within the API's limits.

pub mod firewall;
pub mod rules;
pub mod store;
pub mod vpc;

pub use firewall::{firewall_plan, firewalls_for_address_set, firewalls_for_rule, FirewallContext};
pub use rules::{build_rules, normalize_address, DeclaredRules, ResolvedRule};
pub use store::{FirewallStore, KubeNetworkStore, VpcStore};
pub use vpc::{vpc_plan, VpcContext};
