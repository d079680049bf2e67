//! In-memory cluster and fixtures for controller tests
//!
//! [`FakeCluster`] keeps every object in a map and mimics the API server
//! semantics the loops rely on: names are unique on create, node and
//! finalizer writes are checked against the resourceVersion they were read
//! at, and a deleted tenant disappears once its last finalizer is removed.
//! Each call yields to the runtime first so that reconciles joined on one
//! task interleave at every store access.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use crate::crd::{
    ClusterSizingConfiguration, ClusterSizingConfigurationSpec, ClusterSizingConfigurationStatus,
    Condition, HostedCluster, HostedClusterSpec, Management, SizeConfiguration,
    SIZING_CONFIGURATION_NAME, SIZING_CONFIGURATION_VALID_CONDITION,
};
use crate::error::{Error, Result};

use super::client::ClusterApi;
use super::labels::{
    DEDICATED_REQUEST_SERVING_TOPOLOGY, DEFAULT_PLACEHOLDER_NAMESPACE, HOSTED_CLUSTER_SIZE_LABEL,
    HOSTNAME_LABEL, NODE_SIZE_LABEL, PAIRED_NODES_LABEL, PAIR_LABEL_KEY,
    REQUEST_SERVING_COMPONENT_LABEL, TOPOLOGY_ANNOTATION, ZONE_LABEL,
};
use super::nodes::is_dedicated;
use super::placeholder::pod_selector;

#[derive(Default)]
struct Store {
    tenants: BTreeMap<(String, String), HostedCluster>,
    sizing: Option<ClusterSizingConfiguration>,
    nodes: BTreeMap<String, Node>,
    records: BTreeMap<String, ConfigMap>,
    deployments: BTreeMap<String, Deployment>,
    pods: BTreeMap<String, Pod>,
    resource_version: u64,
    writes: usize,
}

impl Store {
    fn next_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    fn write(&mut self) -> Option<String> {
        self.writes += 1;
        self.next_version()
    }
}

pub struct FakeCluster {
    namespace: String,
    store: Mutex<Store>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            namespace: DEFAULT_PLACEHOLDER_NAMESPACE.to_string(),
            store: Mutex::new(Store::default()),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of writes the loops have issued since the cluster was seeded
    pub fn writes(&self) -> usize {
        self.store().writes
    }

    pub fn put_tenant(&self, mut tenant: HostedCluster) {
        let mut store = self.store();
        tenant.metadata.resource_version = store.next_version();
        let key = (tenant.namespace().unwrap_or_default(), tenant.name_any());
        store.tenants.insert(key, tenant);
    }

    pub fn tenant(&self, namespace: &str, name: &str) -> Option<HostedCluster> {
        self.store()
            .tenants
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Marks a tenant deleted; it is removed right away when nothing holds it
    pub fn delete_tenant(&self, namespace: &str, name: &str) {
        let mut store = self.store();
        let key = (namespace.to_string(), name.to_string());
        let rv = store.next_version();
        let Some(tenant) = store.tenants.get_mut(&key) else {
            return;
        };
        if tenant.finalizers().is_empty() {
            store.tenants.remove(&key);
            return;
        }
        tenant.metadata.deletion_timestamp = Some(Time(Utc::now()));
        tenant.metadata.resource_version = rv;
    }

    /// Removes a finalizer as another controller would
    pub fn strip_finalizer(&self, namespace: &str, name: &str, finalizer: &str) {
        let mut store = self.store();
        let key = (namespace.to_string(), name.to_string());
        let rv = store.next_version();
        let Some(tenant) = store.tenants.get_mut(&key) else {
            return;
        };
        tenant
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .retain(|f| f != finalizer);
        tenant.metadata.resource_version = rv;
        if tenant.finalizers().is_empty() && tenant.metadata.deletion_timestamp.is_some() {
            store.tenants.remove(&key);
        }
    }

    pub fn put_sizing(&self, config: ClusterSizingConfiguration) {
        self.store().sizing = Some(config);
    }

    pub fn put_node(&self, mut node: Node) {
        let mut store = self.store();
        node.metadata.resource_version = store.next_version();
        store.nodes.insert(node.name_any(), node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.store().nodes.get(name).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.store().nodes.values().cloned().collect()
    }

    pub fn records(&self) -> Vec<ConfigMap> {
        self.store().records.values().cloned().collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.store().deployments.get(name).cloned()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.store().deployments.keys().cloned().collect()
    }

    /// Seeds a deployment as if another writer had applied it
    pub fn put_deployment(&self, mut deployment: Deployment) {
        let mut store = self.store();
        deployment.metadata.generation = Some(1);
        deployment.metadata.resource_version = store.next_version();
        store.deployments.insert(deployment.name_any(), deployment);
    }

    /// Schedules one pod of deployment `name` onto each of `nodes` and marks
    /// the deployment ready, the way the workload controller would
    pub fn run_placeholder(&self, name: &str, nodes: &[&str]) {
        let mut store = self.store();
        let Some(deployment) = store.deployments.get(name).cloned() else {
            return;
        };
        let labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_else(|| pod_selector(&deployment));
        store.pods.retain(|_, p| !p.name_any().starts_with(&format!("{name}-")));
        for (i, node) in nodes.iter().enumerate() {
            let pod_name = format!("{name}-{i}");
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(pod_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(node.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            store.pods.insert(pod_name, pod);
        }

        let count = nodes.len() as i32;
        let rv = store.next_version();
        if let Some(d) = store.deployments.get_mut(name) {
            d.metadata.resource_version = rv;
            d.status = Some(DeploymentStatus {
                observed_generation: d.metadata.generation,
                replicas: Some(count),
                updated_replicas: Some(count),
                available_replicas: Some(count),
                ready_replicas: Some(count),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }
}

fn stale(kind: &'static str, name: String) -> Error {
    Error::StaleWrite { kind, name }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    fn placeholder_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<HostedCluster>> {
        tokio::task::yield_now().await;
        Ok(self.tenant(namespace, name))
    }

    async fn list_tenants(&self) -> Result<Vec<HostedCluster>> {
        tokio::task::yield_now().await;
        Ok(self.store().tenants.values().cloned().collect())
    }

    async fn patch_tenant_annotations(
        &self,
        tenant: &HostedCluster,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        let key = (tenant.namespace().unwrap_or_default(), tenant.name_any());
        let rv = store.write();
        let current = store
            .tenants
            .get_mut(&key)
            .ok_or_else(|| stale("HostedCluster", tenant.name_any()))?;
        let annotations = current.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in changes {
            match v {
                Some(v) => annotations.insert(k.clone(), v.clone()),
                None => annotations.remove(k),
            };
        }
        current.metadata.resource_version = rv;
        Ok(())
    }

    async fn set_tenant_finalizers(
        &self,
        tenant: &HostedCluster,
        finalizers: Vec<String>,
    ) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        let key = (tenant.namespace().unwrap_or_default(), tenant.name_any());
        let rv = store.write();
        let current = store
            .tenants
            .get_mut(&key)
            .ok_or_else(|| stale("HostedCluster", tenant.name_any()))?;
        if current.metadata.resource_version != tenant.metadata.resource_version {
            return Err(stale("HostedCluster", tenant.name_any()));
        }
        let emptied = finalizers.is_empty();
        current.metadata.finalizers = Some(finalizers);
        current.metadata.resource_version = rv;
        if emptied && current.metadata.deletion_timestamp.is_some() {
            store.tenants.remove(&key);
        }
        Ok(())
    }

    async fn get_sizing_configuration(&self) -> Result<Option<ClusterSizingConfiguration>> {
        tokio::task::yield_now().await;
        Ok(self.store().sizing.clone())
    }

    async fn list_dedicated_nodes(&self) -> Result<Vec<Node>> {
        tokio::task::yield_now().await;
        Ok(self
            .store()
            .nodes
            .values()
            .filter(|n| is_dedicated(n))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        tokio::task::yield_now().await;
        Ok(self.node(name))
    }

    async fn patch_node(&self, original: &Node, updated: &Node) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        let rv = store.write();
        let name = original.name_any();
        let current = store
            .nodes
            .get_mut(&name)
            .ok_or_else(|| stale("Node", name.clone()))?;
        if current.metadata.resource_version != original.metadata.resource_version {
            return Err(stale("Node", name));
        }
        current.metadata.labels = updated.metadata.labels.clone();
        if let Some(spec) = &updated.spec {
            current.spec.get_or_insert_with(Default::default).taints = spec.taints.clone();
        }
        current.metadata.resource_version = rv;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        store.write();
        store.nodes.remove(name);
        Ok(())
    }

    async fn get_record(&self, name: &str) -> Result<Option<ConfigMap>> {
        tokio::task::yield_now().await;
        Ok(self.store().records.get(name).cloned())
    }

    async fn list_records(&self) -> Result<Vec<ConfigMap>> {
        tokio::task::yield_now().await;
        Ok(self
            .store()
            .records
            .values()
            .filter(|r| r.labels().contains_key(PAIR_LABEL_KEY))
            .cloned()
            .collect())
    }

    async fn create_record(&self, record: &ConfigMap) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        let name = record.name_any();
        if store.records.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "ConfigMap",
                name,
            });
        }
        let mut record = record.clone();
        record.metadata.resource_version = store.write();
        store.records.insert(name, record);
        Ok(())
    }

    async fn delete_record(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        store.write();
        store.records.remove(name);
        Ok(())
    }

    async fn get_placeholder(&self, name: &str) -> Result<Option<Deployment>> {
        tokio::task::yield_now().await;
        Ok(self.deployment(name))
    }

    async fn list_placeholders(&self) -> Result<Vec<Deployment>> {
        tokio::task::yield_now().await;
        Ok(self.store().deployments.values().cloned().collect())
    }

    async fn apply_placeholder(&self, deployment: &Deployment) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        let name = deployment.name_any();
        let existing = store.deployments.get(&name).cloned();
        if let Some(current) = &existing {
            if current.spec == deployment.spec && current.labels() == deployment.labels() {
                return Ok(());
            }
        }
        let rv = store.write();
        let mut applied = deployment.clone();
        applied.metadata.resource_version = rv;
        match existing {
            Some(current) => {
                let spec_changed = current.spec != deployment.spec;
                let generation = current.metadata.generation.unwrap_or(1);
                applied.metadata.generation =
                    Some(if spec_changed { generation + 1 } else { generation });
                applied.status = current.status;
            }
            None => applied.metadata.generation = Some(1),
        }
        store.deployments.insert(name, applied);
        Ok(())
    }

    async fn delete_placeholder(&self, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut store = self.store();
        if store.deployments.remove(name).is_some() {
            store.write();
            store.pods.retain(|_, p| !p.name_any().starts_with(&format!("{name}-")));
        }
        Ok(())
    }

    async fn list_placeholder_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        tokio::task::yield_now().await;
        Ok(self
            .store()
            .pods
            .values()
            .filter(|p| {
                let labels = p.labels();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }
}

/// A request-serving node; an empty `pair` leaves the pair label off
pub fn dedicated_node(name: &str, size: &str, zone: &str, pair: &str) -> Node {
    let mut labels = BTreeMap::from([
        (REQUEST_SERVING_COMPONENT_LABEL.to_string(), "true".to_string()),
        (NODE_SIZE_LABEL.to_string(), size.to_string()),
        (ZONE_LABEL.to_string(), zone.to_string()),
        (HOSTNAME_LABEL.to_string(), name.to_string()),
    ]);
    if !pair.is_empty() {
        labels.insert(PAIRED_NODES_LABEL.to_string(), pair.to_string());
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A tenant with the dedicated request-serving topology
pub fn dedicated_tenant(namespace: &str, name: &str, size: Option<&str>) -> HostedCluster {
    let mut tenant = HostedCluster::new(name, HostedClusterSpec::default());
    tenant.metadata.namespace = Some(namespace.to_string());
    tenant.metadata.annotations = Some(BTreeMap::from([(
        TOPOLOGY_ANNOTATION.to_string(),
        DEDICATED_REQUEST_SERVING_TOPOLOGY.to_string(),
    )]));
    if let Some(size) = size {
        tenant.metadata.labels = Some(BTreeMap::from([(
            HOSTED_CLUSTER_SIZE_LABEL.to_string(),
            size.to_string(),
        )]));
    }
    tenant
}

/// A size class with `placeholders` warm pairs and no effects
pub fn size_class(name: &str, placeholders: u32) -> SizeConfiguration {
    SizeConfiguration {
        name: name.to_string(),
        management: Some(Management { placeholders }),
        ..Default::default()
    }
}

/// A sizing configuration whose validity condition is true
pub fn sizing_config(sizes: Vec<SizeConfiguration>) -> ClusterSizingConfiguration {
    let mut config = ClusterSizingConfiguration::new(
        SIZING_CONFIGURATION_NAME,
        ClusterSizingConfigurationSpec { sizes },
    );
    config.status = Some(ClusterSizingConfigurationStatus {
        conditions: vec![Condition::new(
            SIZING_CONFIGURATION_VALID_CONDITION,
            true,
            "AsExpected",
            "",
        )],
    });
    config
}
