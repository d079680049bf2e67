//! Placeholder deployments
//!
//! Two flavors live in the placeholder namespace:
//!
//! - warm-pool placeholders, `placeholder-{size}-{index}`, which keep a pair
//!   of nodes of each size class running before any tenant asks for them;
//! - tenant-owned placeholders, `{namespace}-{name}`, which the scheduler
//!   creates when a specific tenant needs nodes and no free pair exists.
//!
//! Both run two pause pods that must land on the two nodes of one pair, in
//! distinct zones, on hosts no other placeholder occupies.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodAffinity, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::crd::cluster_key;
use crate::error::{Error, Result};

use super::labels::{
    CONTROL_PLANE_TAINT, HOSTED_CLUSTER_NAMESPACE_LABEL, HOSTED_CLUSTER_NAME_LABEL,
    HOSTED_CLUSTER_SIZE_LABEL, HOSTNAME_LABEL, NODE_SIZE_LABEL, PAIRED_NODES_LABEL,
    PLACEHOLDER_LABEL, REQUEST_SERVING_COMPONENT_LABEL, REQUEST_SERVING_COMPONENT_TAINT,
    ZONE_LABEL,
};

const WARM_POOL_REPLICAS: i32 = 2;

/// Which flavor a deployment in the placeholder namespace is
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placeholder {
    WarmPool { size: String, index: u32 },
    TenantOwned { namespace: String, name: String },
    /// Matches neither naming scheme; logged and left alone
    Unrecognized { reason: String },
}

impl Placeholder {
    pub fn classify(deployment: &Deployment) -> Self {
        let labels = deployment.labels();
        let name = deployment.name_any();

        if labels.contains_key(PLACEHOLDER_LABEL) {
            let Some(size) = labels.get(HOSTED_CLUSTER_SIZE_LABEL) else {
                return Placeholder::Unrecognized {
                    reason: format!("deployment {name} has no size label"),
                };
            };
            return match parse_index(size, &name) {
                Ok(index) => Placeholder::WarmPool {
                    size: size.clone(),
                    index,
                },
                Err(e) => Placeholder::Unrecognized {
                    reason: e.to_string(),
                },
            };
        }

        match (
            labels.get(HOSTED_CLUSTER_NAMESPACE_LABEL),
            labels.get(HOSTED_CLUSTER_NAME_LABEL),
        ) {
            (Some(ns), Some(n)) if cluster_key(ns, n) == name => Placeholder::TenantOwned {
                namespace: ns.clone(),
                name: n.clone(),
            },
            (Some(ns), Some(n)) => Placeholder::Unrecognized {
                reason: format!("deployment {name} is labeled for {ns}/{n} but not named after it"),
            },
            _ => Placeholder::Unrecognized {
                reason: format!("deployment {name} carries no placeholder labels"),
            },
        }
    }
}

pub fn warm_pool_name(size: &str, index: u32) -> String {
    format!("placeholder-{size}-{index}")
}

/// Parses the index out of a `placeholder-{size}-{index}` name
pub fn parse_index(size: &str, name: &str) -> Result<u32> {
    let prefix = format!("placeholder-{size}-");
    let suffix = name.strip_prefix(&prefix).ok_or_else(|| {
        Error::InvariantViolation(format!(
            "deployment {name:?} has invalid format - expected a {prefix:?} prefix"
        ))
    })?;
    suffix.parse().map_err(|_| {
        Error::InvariantViolation(format!(
            "deployment {name:?} has invalid placeholder index {suffix:?}"
        ))
    })
}

/// Pair labels excluded through the `NotIn` node-affinity of a deployment
pub fn excluded_pair_labels(deployment: &Deployment) -> BTreeSet<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|selector| {
            selector
                .node_selector_terms
                .iter()
                .flat_map(|term| term.match_expressions.iter().flatten())
                .filter(|e| e.key == PAIRED_NODES_LABEL && e.operator == "NotIn")
                .flat_map(|e| e.values.iter().flatten().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// True when every desired replica is updated and available and the
/// controller has observed the latest spec
pub fn is_deployment_ready(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    if let (Some(generation), Some(observed)) =
        (deployment.metadata.generation, status.observed_generation)
    {
        if observed < generation {
            return false;
        }
    }
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if status.replicas.unwrap_or(0) != desired
        || status.updated_replicas.unwrap_or(0) != desired
        || status.available_replicas.unwrap_or(0) != desired
        || status.unavailable_replicas.unwrap_or(0) != 0
    {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .filter(|c| c.type_ == "Available")
        .all(|c| c.status == "True")
}

/// Pod label selector of a deployment
pub fn pod_selector(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default()
}

/// Builds a warm-pool placeholder for `size` at `index`
pub fn warm_pool_deployment(
    namespace: &str,
    image: &str,
    size: &str,
    index: u32,
    excluded: &BTreeSet<String>,
) -> Deployment {
    let index_value = index.to_string();
    let labels = BTreeMap::from([
        (PLACEHOLDER_LABEL.to_string(), index_value.clone()),
        (HOSTED_CLUSTER_SIZE_LABEL.to_string(), size.to_string()),
    ]);
    let this_index = || {
        label_expression(PLACEHOLDER_LABEL, "In", Some(vec![index_value.clone()]))
    };

    let affinity = Affinity {
        node_affinity: not_in_pair_labels(excluded),
        pod_affinity: Some(PodAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![selector_term(
                this_index(),
                PAIRED_NODES_LABEL,
            )]),
            ..Default::default()
        }),
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![
                selector_term(this_index(), ZONE_LABEL),
                selector_term(
                    label_expression(PLACEHOLDER_LABEL, "Exists", None),
                    HOSTNAME_LABEL,
                ),
                selector_term(
                    label_expression(PLACEHOLDER_LABEL, "NotIn", Some(vec![index_value.clone()])),
                    PAIRED_NODES_LABEL,
                ),
            ]),
            ..Default::default()
        }),
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(warm_pool_name(size, index)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(placeholder_spec(
            WARM_POOL_REPLICAS,
            labels,
            node_selector(size, None),
            affinity,
            image,
        )),
        ..Default::default()
    }
}

/// Builds the placeholder a tenant uses to pull a pair of nodes into existence.
///
/// With a known pair the pods are pinned to it; otherwise they must co-locate
/// on some pair outside `excluded`.
#[allow(clippy::too_many_arguments)]
pub fn tenant_deployment(
    namespace: &str,
    image: &str,
    tenant_namespace: &str,
    tenant_name: &str,
    size: &str,
    pair_label: Option<&str>,
    excluded: &BTreeSet<String>,
    replicas: i32,
) -> Deployment {
    let name = cluster_key(tenant_namespace, tenant_name);
    let pod_labels = BTreeMap::from([(PLACEHOLDER_LABEL.to_string(), name.clone())]);
    let this_deployment = || LabelSelector {
        match_labels: Some(pod_labels.clone()),
        ..Default::default()
    };

    let (node_affinity, pod_affinity) = match pair_label {
        Some(_) => (None, None),
        None => (
            not_in_pair_labels(excluded),
            Some(PodAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![
                    selector_term(this_deployment(), PAIRED_NODES_LABEL),
                ]),
                ..Default::default()
            }),
        ),
    };
    let affinity = Affinity {
        node_affinity,
        pod_affinity,
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![
                selector_term(this_deployment(), ZONE_LABEL),
                selector_term(
                    label_expression(PLACEHOLDER_LABEL, "Exists", None),
                    HOSTNAME_LABEL,
                ),
                selector_term(
                    label_expression(PLACEHOLDER_LABEL, "NotIn", Some(vec![name.clone()])),
                    PAIRED_NODES_LABEL,
                ),
            ]),
            ..Default::default()
        }),
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (HOSTED_CLUSTER_NAME_LABEL.to_string(), tenant_name.to_string()),
                (
                    HOSTED_CLUSTER_NAMESPACE_LABEL.to_string(),
                    tenant_namespace.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(placeholder_spec(
            replicas,
            pod_labels,
            node_selector(size, pair_label),
            affinity,
            image,
        )),
        ..Default::default()
    }
}

fn placeholder_spec(
    replicas: i32,
    pod_labels: BTreeMap<String, String>,
    node_selector: BTreeMap<String, String>,
    affinity: Affinity,
    image: &str,
) -> DeploymentSpec {
    DeploymentSpec {
        replicas: Some(replicas),
        selector: LabelSelector {
            match_labels: Some(pod_labels.clone()),
            ..Default::default()
        },
        strategy: Some(DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            ..Default::default()
        }),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(pod_labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                node_selector: Some(node_selector),
                affinity: Some(affinity),
                tolerations: Some(vec![
                    dedicated_toleration(REQUEST_SERVING_COMPONENT_TAINT),
                    dedicated_toleration(CONTROL_PLANE_TAINT),
                ]),
                containers: vec![Container {
                    name: "placeholder".to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

fn node_selector(size: &str, pair_label: Option<&str>) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::from([
        (REQUEST_SERVING_COMPONENT_LABEL.to_string(), "true".to_string()),
        (NODE_SIZE_LABEL.to_string(), size.to_string()),
    ]);
    if let Some(pair) = pair_label {
        selector.insert(PAIRED_NODES_LABEL.to_string(), pair.to_string());
    }
    selector
}

/// `NotIn` node-affinity over pair labels; absent when there is nothing to exclude
fn not_in_pair_labels(excluded: &BTreeSet<String>) -> Option<NodeAffinity> {
    if excluded.is_empty() {
        return None;
    }
    Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: PAIRED_NODES_LABEL.to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(excluded.iter().cloned().collect()),
                }]),
                ..Default::default()
            }],
        }),
        ..Default::default()
    })
}

fn dedicated_toleration(key: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Equal".to_string()),
        value: Some("true".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }
}

fn label_expression(key: &str, operator: &str, values: Option<Vec<String>>) -> LabelSelector {
    LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values,
        }]),
        ..Default::default()
    }
}

fn selector_term(selector: LabelSelector, topology_key: &str) -> PodAffinityTerm {
    PodAffinityTerm {
        label_selector: Some(selector),
        topology_key: topology_key.to_string(),
        ..Default::default()
    }
}
