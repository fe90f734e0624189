//! StratusCluster controller
//!
//! Provisions the control plane load balancer of a cluster and keeps its
//! backends pointed at the cluster's control plane machines.

pub mod backends;
pub mod controller;
pub mod store;

pub use backends::{select_targets, BackendTarget, Member};
pub use controller::{cluster_for_machine, cluster_plan, error_policy, reconcile, Context};
pub use store::{ClusterStore, KubeClusterStore};
