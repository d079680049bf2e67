//! Enqueue rules: which objects a watched change should reconcile
//!
//! Every mapper here is a pure function of the changed object and, where a
//! fan-out is needed, a snapshot of a reflector store.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::crd::{ClusterSizingConfiguration, HostedCluster, SIZING_CONFIGURATION_NAME};

use super::labels::{HOSTED_CLUSTER_LABEL, HOSTED_CLUSTER_NAMESPACE_LABEL, HOSTED_CLUSTER_NAME_LABEL};
use super::nodes::{is_dedicated, owner, pair_label};
use super::placeholder::Placeholder;

pub fn tenant_ref(namespace: &str, name: &str) -> ObjectRef<HostedCluster> {
    ObjectRef::new(name).within(namespace)
}

/// Scheduler trigger for a node change.
///
/// A claimed node enqueues its tenant. An unclaimed node enqueues the tenant
/// of the first claimed sibling sharing its pair label, so that a freshly
/// provisioned second node of a pair gets backfilled.
pub fn tenant_for_node<'a>(
    node: &Node,
    all_nodes: impl IntoIterator<Item = &'a Node>,
) -> Option<ObjectRef<HostedCluster>> {
    if !is_dedicated(node) {
        return None;
    }
    if let Some((namespace, name)) = owner(node) {
        return Some(tenant_ref(namespace, name));
    }
    let pair = pair_label(node)?;
    all_nodes
        .into_iter()
        .filter(|sibling| sibling.name_any() != node.name_any())
        .filter(|sibling| pair_label(sibling) == Some(pair))
        .find_map(owner)
        .map(|(namespace, name)| tenant_ref(namespace, name))
}

/// Scheduler trigger for a deployment change in the placeholder namespace
pub fn tenant_for_placeholder(deployment: &Deployment) -> Option<ObjectRef<HostedCluster>> {
    let labels = deployment.labels();
    match (
        labels.get(HOSTED_CLUSTER_NAMESPACE_LABEL),
        labels.get(HOSTED_CLUSTER_NAME_LABEL),
    ) {
        (Some(namespace), Some(name)) => Some(tenant_ref(namespace, name)),
        _ => None,
    }
}

/// Scheduler trigger for a sizing configuration change: every tenant
pub fn all_tenants<'a>(
    tenants: impl IntoIterator<Item = &'a HostedCluster>,
) -> Vec<ObjectRef<HostedCluster>> {
    tenants.into_iter().map(ObjectRef::from_obj).collect()
}

/// The creator is keyed on the singleton sizing configuration
pub fn creator_key() -> ObjectRef<ClusterSizingConfiguration> {
    ObjectRef::new(SIZING_CONFIGURATION_NAME)
}

/// Updater trigger for a configuration or node change: every warm-pool deployment
pub fn warm_pool_deployments<'a>(
    deployments: impl IntoIterator<Item = &'a Deployment>,
) -> Vec<ObjectRef<Deployment>> {
    deployments
        .into_iter()
        .filter(|d| matches!(Placeholder::classify(d), Placeholder::WarmPool { .. }))
        .map(ObjectRef::from_obj)
        .collect()
}

/// Reaper trigger for a tenant change: the nodes claimed for that tenant
pub fn nodes_for_tenant<'a>(
    tenant: &HostedCluster,
    nodes: impl IntoIterator<Item = &'a Node>,
) -> Vec<ObjectRef<Node>> {
    let key = tenant.cluster_key();
    nodes
        .into_iter()
        .filter(|n| n.labels().get(HOSTED_CLUSTER_LABEL) == Some(&key))
        .map(ObjectRef::from_obj)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::nodes::labeled_for_tenant;
    use crate::controller::placeholder::{tenant_deployment, warm_pool_deployment};
    use crate::controller::testing::{dedicated_node, dedicated_tenant};
    use std::collections::BTreeSet;

    #[test]
    fn test_claimed_node_enqueues_its_tenant() {
        let node = labeled_for_tenant(&dedicated_node("n1", "small", "z1", "P"), "T", "c");
        assert_eq!(
            tenant_for_node(&node, std::iter::empty()),
            Some(tenant_ref("T", "c"))
        );
    }

    #[test]
    fn test_unclaimed_node_follows_its_pair_sibling() {
        let claimed = labeled_for_tenant(&dedicated_node("n1", "small", "z1", "P"), "T", "c");
        let fresh = dedicated_node("n2", "small", "z2", "P");
        let other = labeled_for_tenant(&dedicated_node("n3", "small", "z1", "Q"), "T", "d");
        let all = vec![other, claimed, fresh.clone()];

        assert_eq!(
            tenant_for_node(&fresh, all.iter()),
            Some(tenant_ref("T", "c"))
        );
    }

    #[test]
    fn test_unpaired_or_foreign_nodes_enqueue_nothing() {
        let unpaired = dedicated_node("n1", "small", "z1", "");
        assert_eq!(tenant_for_node(&unpaired, std::iter::empty()), None);

        let mut worker = dedicated_node("w1", "small", "z1", "P");
        worker.metadata.labels = None;
        assert_eq!(tenant_for_node(&worker, std::iter::empty()), None);
    }

    #[test]
    fn test_only_tenant_placeholders_enqueue_tenants() {
        let owned = tenant_deployment("ns", "img", "T", "c", "small", None, &BTreeSet::new(), 2);
        assert_eq!(tenant_for_placeholder(&owned), Some(tenant_ref("T", "c")));

        let warm = warm_pool_deployment("ns", "img", "small", 0, &BTreeSet::new());
        assert_eq!(tenant_for_placeholder(&warm), None);
        assert_eq!(warm_pool_deployments([&owned, &warm]).len(), 1);
    }

    #[test]
    fn test_tenant_change_maps_to_claimed_nodes() {
        let tenant = dedicated_tenant("T", "c", Some("small"));
        let mine = labeled_for_tenant(&dedicated_node("n1", "small", "z1", "P"), "T", "c");
        let free = dedicated_node("n2", "small", "z2", "P");

        let refs = nodes_for_tenant(&tenant, [&mine, &free]);
        assert_eq!(refs, vec![ObjectRef::new("n1")]);
    }
}
