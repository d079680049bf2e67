//! Dedicated node helpers
//!
//! A dedicated node is one carrying the request-serving component label. It
//! is claimed by a tenant once it carries the three hosted-cluster labels and
//! the cluster taint, all with that tenant's key.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ConfigMap, Node, NodeSpec, Taint};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::cluster_key;
use crate::error::Result;

use super::client::ClusterApi;
use super::labels::{
    HOSTED_CLUSTER_LABEL, HOSTED_CLUSTER_NAMESPACE_LABEL, HOSTED_CLUSTER_NAME_LABEL,
    HOSTED_CLUSTER_TAINT, NODE_SIZE_LABEL, PAIRED_NODES_LABEL, REQUEST_SERVING_COMPONENT_LABEL,
    ZONE_LABEL,
};
use super::pair_record::recorded_pair_labels;

/// Non-empty value of a node label
pub fn label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.labels()
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

pub fn is_dedicated(node: &Node) -> bool {
    node.labels().contains_key(REQUEST_SERVING_COMPONENT_LABEL)
}

pub fn is_deleting(node: &Node) -> bool {
    node.metadata.deletion_timestamp.is_some()
}

pub fn pair_label(node: &Node) -> Option<&str> {
    label(node, PAIRED_NODES_LABEL)
}

pub fn zone(node: &Node) -> Option<&str> {
    label(node, ZONE_LABEL)
}

pub fn size(node: &Node) -> Option<&str> {
    label(node, NODE_SIZE_LABEL)
}

/// Key of the tenant a node is labeled for
pub fn owner_key(node: &Node) -> Option<&str> {
    label(node, HOSTED_CLUSTER_LABEL)
}

/// Tenant coordinates from the name and namespace labels, when both are set
pub fn owner(node: &Node) -> Option<(&str, &str)> {
    Some((
        label(node, HOSTED_CLUSTER_NAMESPACE_LABEL)?,
        label(node, HOSTED_CLUSTER_NAME_LABEL)?,
    ))
}

/// Pair labels no placeholder may land on: pairs with a claimed node plus
/// pairs recorded for a tenant but not labeled yet
pub fn claimed_pair_labels(nodes: &[Node], records: &[ConfigMap]) -> BTreeSet<String> {
    let mut claimed = recorded_pair_labels(records);
    claimed.extend(
        nodes
            .iter()
            .filter(|n| owner_key(n).is_some())
            .filter_map(pair_label)
            .map(str::to_string),
    );
    claimed
}

/// Distinct zones covered by `nodes`
pub fn zones<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> BTreeSet<String> {
    nodes
        .into_iter()
        .filter_map(zone)
        .map(str::to_string)
        .collect()
}

/// Returns `node` carrying the hosted-cluster labels and cluster taint for
/// the tenant. Applying it twice yields the same node as applying it once.
pub fn labeled_for_tenant(node: &Node, namespace: &str, name: &str) -> Node {
    let key = cluster_key(namespace, name);
    let mut updated = node.clone();

    let labels = updated.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(HOSTED_CLUSTER_LABEL.to_string(), key.clone());
    labels.insert(HOSTED_CLUSTER_NAME_LABEL.to_string(), name.to_string());
    labels.insert(HOSTED_CLUSTER_NAMESPACE_LABEL.to_string(), namespace.to_string());

    let taints = updated
        .spec
        .get_or_insert_with(NodeSpec::default)
        .taints
        .get_or_insert_with(Vec::new);
    match taints.iter_mut().find(|t| t.key == HOSTED_CLUSTER_TAINT) {
        Some(taint) => {
            taint.value = Some(key);
            taint.effect = "NoSchedule".to_string();
        }
        None => taints.push(Taint {
            key: HOSTED_CLUSTER_TAINT.to_string(),
            value: Some(key),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }),
    }
    updated
}

/// Labels and taints `node` for the tenant with an optimistic-locked patch.
///
/// Returns false when the node already carried everything and no write was needed.
pub async fn claim_node(
    api: &dyn ClusterApi,
    node: &Node,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    let updated = labeled_for_tenant(node, namespace, name);
    if updated == *node {
        debug!(node = %node.name_any(), "Node already labeled for tenant");
        return Ok(false);
    }
    api.patch_node(node, &updated).await?;
    info!(
        node = %node.name_any(),
        tenant = %format!("{namespace}/{name}"),
        "Node tainted and labeled for hosted cluster"
    );
    Ok(true)
}

/// Dedicated nodes split by their relation to one tenant
#[derive(Debug, Default)]
pub struct TenantNodes<'a> {
    /// Non-deleting nodes labeled for the tenant with the desired size
    pub owned_sized: Vec<&'a Node>,
    /// Non-deleting nodes with no tenant label
    pub available: Vec<&'a Node>,
}

impl<'a> TenantNodes<'a> {
    pub fn classify(nodes: &'a [Node], key: &str, desired_size: &str) -> Self {
        let mut out = TenantNodes::default();
        for node in nodes.iter().filter(|n| !is_deleting(n)) {
            match owner_key(node) {
                Some(owner) if owner == key => {
                    if size(node) == Some(desired_size) {
                        out.owned_sized.push(node);
                    }
                }
                Some(_) => {}
                None => out.available.push(node),
            }
        }
        out
    }

    /// First non-empty pair label among the tenant's nodes of the desired size
    pub fn pair_label(&self) -> Option<&'a str> {
        self.owned_sized.iter().find_map(|n| pair_label(n))
    }

    /// Owned nodes of the desired size on `pair`
    pub fn goal(&self, pair: &str) -> Vec<&'a Node> {
        self.owned_sized
            .iter()
            .copied()
            .filter(|n| pair_label(n) == Some(pair))
            .collect()
    }

    /// Unclaimed nodes of the desired size on `pair`
    pub fn backfill_candidates(&self, pair: &str, desired_size: &str) -> Vec<&'a Node> {
        self.available
            .iter()
            .copied()
            .filter(|n| pair_label(n) == Some(pair) && size(n) == Some(desired_size))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::dedicated_node;

    #[test]
    fn test_labeling_is_idempotent() {
        let node = dedicated_node("n1", "small", "z1", "P");
        let once = labeled_for_tenant(&node, "T", "c");
        let twice = labeled_for_tenant(&once, "T", "c");
        assert_eq!(once, twice);

        assert_eq!(owner_key(&once), Some("T-c"));
        assert_eq!(owner(&once), Some(("T", "c")));
        let taints = once.spec.as_ref().unwrap().taints.as_ref().unwrap();
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].value.as_deref(), Some("T-c"));
        assert_eq!(taints[0].effect, "NoSchedule");
    }

    #[test]
    fn test_labeling_replaces_existing_cluster_taint() {
        let mut node = dedicated_node("n1", "small", "z1", "P");
        node.spec = Some(NodeSpec {
            taints: Some(vec![
                Taint {
                    key: HOSTED_CLUSTER_TAINT.to_string(),
                    value: Some("old-tenant".to_string()),
                    effect: "NoExecute".to_string(),
                    ..Default::default()
                },
                Taint {
                    key: "other".to_string(),
                    effect: "NoSchedule".to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        let labeled = labeled_for_tenant(&node, "T", "c");
        let taints = labeled.spec.unwrap().taints.unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[0].value.as_deref(), Some("T-c"));
        assert_eq!(taints[0].effect, "NoSchedule");
    }

    #[test]
    fn test_claimed_pair_labels_include_records() {
        let claimed = labeled_for_tenant(&dedicated_node("n1", "small", "z1", "P"), "T", "c");
        let free = dedicated_node("n2", "small", "z2", "Q");
        let record = crate::controller::pair_record::build_record(
            "ns",
            "R",
            &crate::controller::pair_record::RecordOwner::new("T", "d"),
        );
        assert_eq!(
            claimed_pair_labels(&[claimed, free], &[record]),
            BTreeSet::from(["P".to_string(), "R".to_string()])
        );
    }

    #[test]
    fn test_classify_splits_owned_and_available() {
        let mut deleting = dedicated_node("gone", "small", "z1", "Q");
        deleting.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let nodes = vec![
            labeled_for_tenant(&dedicated_node("a", "small", "z1", "P"), "T", "c"),
            labeled_for_tenant(&dedicated_node("b", "medium", "z2", "M"), "T", "c"),
            labeled_for_tenant(&dedicated_node("c", "small", "z2", "X"), "T", "other"),
            dedicated_node("d", "small", "z2", "P"),
            deleting,
        ];
        let view = TenantNodes::classify(&nodes, "T-c", "small");
        assert_eq!(view.owned_sized.len(), 1);
        assert_eq!(view.pair_label(), Some("P"));
        assert_eq!(view.goal("P").len(), 1);
        assert_eq!(view.available.len(), 1);
        assert_eq!(view.backfill_candidates("P", "small").len(), 1);
        assert!(view.backfill_candidates("P", "medium").is_empty());
    }
}
