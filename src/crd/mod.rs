//! Custom resources consumed by the pair scheduler
//!
//! `HostedCluster` is authored elsewhere and only partially modeled here.
//! `ClusterSizingConfiguration` is read-only for this crate; `crdgen` prints
//! its definition for installation in test clusters.

mod hosted_cluster;
mod sizing;
pub mod types;


pub use hosted_cluster::{cluster_key, HostedCluster, HostedClusterSpec};
pub use sizing::{
    ClusterSizingConfiguration, ClusterSizingConfigurationSpec, ClusterSizingConfigurationStatus,
    Effects, Management, NodeCountCriteria, ResourceRequest, SizeConfiguration,
    SIZING_CONFIGURATION_NAME, SIZING_CONFIGURATION_VALID_CONDITION,
};
pub use types::*;
