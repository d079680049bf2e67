//! Well-known label, annotation, taint and finalizer names
//!
//! These strings are shared with the fleet manager, the hosted-cluster
//! reconciler and the control-plane components that consume the projected
//! annotations, so they must match bit for bit.

// Node labels
pub const REQUEST_SERVING_COMPONENT_LABEL: &str = "hypershift.openshift.io/request-serving-component";
pub const NODE_SIZE_LABEL: &str = "hypershift.openshift.io/cluster-size";
pub const PAIRED_NODES_LABEL: &str = "osd-fleet-manager.openshift.io/paired-nodes";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const HOSTED_CLUSTER_LABEL: &str = "hypershift.openshift.io/cluster";
pub const HOSTED_CLUSTER_NAME_LABEL: &str = "hypershift.openshift.io/cluster-name";
pub const HOSTED_CLUSTER_NAMESPACE_LABEL: &str = "hypershift.openshift.io/cluster-namespace";
pub const GO_MEM_LIMIT_LABEL: &str = "hypershift.openshift.io/request-serving-gomemlimit";
pub const LB_SUBNETS_LABEL: &str = "hypershift.openshift.io/request-serving-subnets";

// Taints
pub const HOSTED_CLUSTER_TAINT: &str = "hypershift.openshift.io/cluster";
pub const CONTROL_PLANE_TAINT: &str = "hypershift.openshift.io/control-plane";
pub const REQUEST_SERVING_COMPONENT_TAINT: &str =
    "hypershift.openshift.io/request-serving-component";

// Placeholder deployments
pub const PLACEHOLDER_LABEL: &str = "hypershift.openshift.io/placeholder";
pub const HOSTED_CLUSTER_SIZE_LABEL: &str = "hypershift.openshift.io/hosted-cluster-size";
pub const DEFAULT_PLACEHOLDER_NAMESPACE: &str = "hypershift-request-serving-node-placeholders";
pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "registry.access.redhat.com/ubi8/pause:latest";
pub const FIELD_MANAGER: &str = "PlaceholderScheduler";

// Coordination records
pub const PAIR_LABEL_KEY: &str = "hypershift.openshift.io/pairlabel";
pub const CLUSTER_NAMESPACE_KEY: &str = "clusterNamespace";
pub const CLUSTER_NAME_KEY: &str = "clusterName";

// Tenant
pub const TOPOLOGY_ANNOTATION: &str = "hypershift.openshift.io/topology";
pub const DEDICATED_REQUEST_SERVING_TOPOLOGY: &str = "dedicated-request-serving-components";
pub const SCHEDULER_FINALIZER: &str = "hypershift.openshift.io/dedicated-request-serving-scheduler";
pub const HOSTED_CLUSTER_FINALIZER: &str = "hypershift.openshift.io/finalizer";

// Projected tenant annotations
pub const SCHEDULED_ANNOTATION: &str = "hypershift.openshift.io/cluster-scheduled";
pub const KAS_GO_MEM_LIMIT_ANNOTATION: &str = "hypershift.openshift.io/kube-apiserver-gomemlimit";
pub const CONTROL_PLANE_PRIORITY_CLASS_ANNOTATION: &str =
    "hypershift.openshift.io/control-plane-priority-class";
pub const ETCD_PRIORITY_CLASS_ANNOTATION: &str = "hypershift.openshift.io/etcd-priority-class";
pub const API_CRITICAL_PRIORITY_CLASS_ANNOTATION: &str =
    "hypershift.openshift.io/api-critical-priority-class";
pub const MAX_REQUESTS_INFLIGHT_ANNOTATION: &str =
    "hypershift.openshift.io/kube-apiserver-max-requests-inflight";
pub const MAX_MUTATING_REQUESTS_INFLIGHT_ANNOTATION: &str =
    "hypershift.openshift.io/kube-apiserver-max-mutating-requests-inflight";
pub const RESOURCE_REQUEST_OVERRIDE_PREFIX: &str = "resource-request-override.hypershift.openshift.io";
pub const MACHINE_HEALTH_CHECK_TIMEOUT_ANNOTATION: &str =
    "hypershift.openshift.io/machine-health-check-timeout";
pub const LB_SUBNETS_ANNOTATION: &str = "hypershift.openshift.io/aws-load-balancer-subnets";
pub const LB_TARGET_NODES_ANNOTATION: &str =
    "hypershift.openshift.io/aws-load-balancer-target-node-labels";
pub const NODE_ADDITIONAL_SELECTOR_ANNOTATION: &str =
    "hypershift.openshift.io/request-serving-node-additional-selector";
