//! Partial view of the HostedCluster resource
//!
//! Only the fields the scheduler reads are modeled. Everything else on the
//! object is owned by the hosted-cluster reconciler and is left untouched:
//! all writes go out as merge patches against metadata.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controller::labels::{
    DEDICATED_REQUEST_SERVING_TOPOLOGY, HOSTED_CLUSTER_SIZE_LABEL, TOPOLOGY_ANNOTATION,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "HostedCluster",
    namespaced,
    shortname = "hc"
)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterSpec {
    /// Pauses reconciliation: either "true" or an RFC3339 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<String>,
}

impl HostedCluster {
    /// The `{namespace}-{name}` key used on node labels, taints and the tenant placeholder
    pub fn cluster_key(&self) -> String {
        cluster_key(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    pub fn is_dedicated_request_serving(&self) -> bool {
        self.annotations().get(TOPOLOGY_ANNOTATION).map(String::as_str)
            == Some(DEDICATED_REQUEST_SERVING_TOPOLOGY)
    }

    /// Size class chosen by the external sizer, if any
    pub fn desired_size(&self) -> Option<&str> {
        self.labels()
            .get(HOSTED_CLUSTER_SIZE_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

pub fn cluster_key(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}
