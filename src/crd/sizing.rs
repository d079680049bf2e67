//! ClusterSizingConfiguration custom resource
//!
//! A single cluster-scoped object named `cluster` enumerates the size classes
//! available to hosted clusters. Each class optionally asks for a number of
//! warm-pool placeholders and for effects to project onto tenants of that
//! size. The object is validated by an external controller which reports the
//! outcome in the `ClusterSizingConfigurationValid` condition; every loop in
//! this crate treats an object without that condition set to `True` as absent.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Name of the singleton sizing configuration
pub const SIZING_CONFIGURATION_NAME: &str = "cluster";

/// Condition type reporting that the configuration passed validation
pub const SIZING_CONFIGURATION_VALID_CONDITION: &str = "ClusterSizingConfigurationValid";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "scheduling.hypershift.openshift.io",
    version = "v1alpha1",
    kind = "ClusterSizingConfiguration",
    status = "ClusterSizingConfigurationStatus",
    printcolumn = r#"{"name":"Valid","type":"string","jsonPath":".status.conditions[?(@.type=='ClusterSizingConfigurationValid')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizingConfigurationSpec {
    /// Size classes, in the order the placeholder creator visits them
    #[serde(default)]
    pub sizes: Vec<SizeConfiguration>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SizeConfiguration {
    pub name: String,

    /// Node-count range that selects this class. Consumed by the external sizer.
    #[serde(default)]
    pub criteria: NodeCountCriteria,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<Management>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeCountCriteria {
    #[serde(default)]
    pub from: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<u32>,
}

/// Settings projected onto tenants of a size class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Effects {
    /// Memory limit for the kube-apiserver Go runtime, as a quantity string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kas_go_mem_limit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_priority_class_name: Option<String>,

    #[serde(
        default,
        rename = "APICriticalPriorityClassName",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_critical_priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_requests: Vec<ResourceRequest>,

    /// Duration string such as "30s" or "1h5m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_health_check_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_requests_inflight: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_mutating_requests_inflight: Option<i64>,
}

/// Resource request override for one container of one control-plane deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub deployment_name: String,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Management {
    /// Number of warm-pool placeholder deployments to keep for this class
    #[serde(default)]
    pub placeholders: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSizingConfigurationStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ClusterSizingConfiguration {
    /// True when the validity condition is present with status `True`
    pub fn is_valid(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.type_ == SIZING_CONFIGURATION_VALID_CONDITION)
            })
            .map(Condition::is_true)
            .unwrap_or(false)
    }

    pub fn size(&self, name: &str) -> Option<&SizeConfiguration> {
        self.spec.sizes.iter().find(|s| s.name == name)
    }

    /// Configured warm-pool placeholders for a size class; unknown classes want none
    pub fn placeholders_for(&self, name: &str) -> u32 {
        self.size(name).map(SizeConfiguration::placeholders).unwrap_or(0)
    }
}

impl SizeConfiguration {
    pub fn placeholders(&self) -> u32 {
        self.management.as_ref().map(|m| m.placeholders).unwrap_or(0)
    }
}
