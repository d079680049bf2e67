//! Store access for the control loops
//!
//! Every read and write the loops perform goes through [`ClusterApi`]. The
//! kube-backed implementation talks to the API server; tests use the
//! in-memory implementation in `testing.rs`, which enforces the same
//! create-on-unique-name and resourceVersion semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{ClusterSizingConfiguration, HostedCluster, SIZING_CONFIGURATION_NAME};
use crate::error::{Error, Result};

use super::labels::{FIELD_MANAGER, PAIR_LABEL_KEY, REQUEST_SERVING_COMPONENT_LABEL};

/// Read/write surface of the resource store used by all loops
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace holding placeholder deployments and coordination records
    fn placeholder_namespace(&self) -> &str;

    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<HostedCluster>>;
    async fn list_tenants(&self) -> Result<Vec<HostedCluster>>;
    /// Sets (`Some`) or removes (`None`) tenant annotations in a single patch
    async fn patch_tenant_annotations(
        &self,
        tenant: &HostedCluster,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;
    /// Replaces the finalizer list, guarded by the tenant's resourceVersion
    async fn set_tenant_finalizers(
        &self,
        tenant: &HostedCluster,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn get_sizing_configuration(&self) -> Result<Option<ClusterSizingConfiguration>>;

    /// Nodes carrying the request-serving component label
    async fn list_dedicated_nodes(&self) -> Result<Vec<Node>>;
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    /// Writes the labels and taints of `updated`, failing with a stale-write
    /// error when the node changed since `original` was read
    async fn patch_node(&self, original: &Node, updated: &Node) -> Result<()>;
    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn get_record(&self, name: &str) -> Result<Option<ConfigMap>>;
    async fn list_records(&self) -> Result<Vec<ConfigMap>>;
    /// Creates a record; fails with `AlreadyExists` when the name is taken
    async fn create_record(&self, record: &ConfigMap) -> Result<()>;
    /// Deletes a record; a missing record is not an error
    async fn delete_record(&self, name: &str) -> Result<()>;

    async fn get_placeholder(&self, name: &str) -> Result<Option<Deployment>>;
    async fn list_placeholders(&self) -> Result<Vec<Deployment>>;
    /// Server-side applies a placeholder deployment
    async fn apply_placeholder(&self, deployment: &Deployment) -> Result<()>;
    /// Deletes a placeholder deployment; a missing deployment is not an error
    async fn delete_placeholder(&self, name: &str) -> Result<()>;
    async fn list_placeholder_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>>;
}

/// [`ClusterApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
    dry_run: bool,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: impl Into<String>, dry_run: bool) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            dry_run,
        }
    }

    /// Server-side applies the placeholder namespace
    pub async fn ensure_namespace(&self) -> Result<()> {
        if self.dry_run {
            info!(namespace = %self.namespace, "dry-run: would apply placeholder namespace");
            return Ok(());
        }
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": self.namespace }
        });
        api.patch(&self.namespace, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    fn tenants(&self, namespace: &str) -> Api<HostedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn records(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Maps a 409 on a guarded write to [`Error::StaleWrite`]
fn stale_on_conflict(kind: &'static str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::StaleWrite {
            kind,
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

fn ignore_not_found(res: std::result::Result<(), kube::Error>) -> Result<()> {
    match res {
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        other => other.map_err(Error::from),
    }
}

/// Renders a label map as an equality selector string
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    fn placeholder_namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<HostedCluster>> {
        Ok(self.tenants(namespace).get_opt(name).await?)
    }

    async fn list_tenants(&self) -> Result<Vec<HostedCluster>> {
        let api: Api<HostedCluster> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_tenant_annotations(
        &self,
        tenant: &HostedCluster,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let name = tenant.name_any();
        let namespace = tenant.namespace().unwrap_or_default();
        if self.dry_run {
            info!(%namespace, %name, ?changes, "dry-run: would patch tenant annotations");
            return Ok(());
        }
        let patch = json!({ "metadata": { "annotations": changes } });
        self.tenants(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(%namespace, %name, "Patched tenant annotations");
        Ok(())
    }

    async fn set_tenant_finalizers(
        &self,
        tenant: &HostedCluster,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let name = tenant.name_any();
        let namespace = tenant.namespace().unwrap_or_default();
        if self.dry_run {
            info!(%namespace, %name, ?finalizers, "dry-run: would set tenant finalizers");
            return Ok(());
        }
        let patch = json!({
            "metadata": {
                "resourceVersion": tenant.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.tenants(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| stale_on_conflict("HostedCluster", &name, e))?;
        Ok(())
    }

    async fn get_sizing_configuration(&self) -> Result<Option<ClusterSizingConfiguration>> {
        let api: Api<ClusterSizingConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(SIZING_CONFIGURATION_NAME).await?)
    }

    async fn list_dedicated_nodes(&self) -> Result<Vec<Node>> {
        let params = ListParams::default().labels(REQUEST_SERVING_COMPONENT_LABEL);
        Ok(self.nodes().list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes().get_opt(name).await?)
    }

    async fn patch_node(&self, original: &Node, updated: &Node) -> Result<()> {
        let name = updated.name_any();
        if self.dry_run {
            info!(node = %name, labels = ?updated.labels(), "dry-run: would label and taint node");
            return Ok(());
        }
        let taints = updated.spec.as_ref().and_then(|s| s.taints.clone());
        let patch = json!({
            "metadata": {
                "resourceVersion": original.resource_version(),
                "labels": updated.labels(),
            },
            "spec": { "taints": taints },
        });
        self.nodes()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| stale_on_conflict("Node", &name, e))?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        if self.dry_run {
            info!(node = %name, "dry-run: would delete node");
            return Ok(());
        }
        ignore_not_found(
            self.nodes()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_record(&self, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.records().get_opt(name).await?)
    }

    async fn list_records(&self) -> Result<Vec<ConfigMap>> {
        let params = ListParams::default().labels(PAIR_LABEL_KEY);
        Ok(self.records().list(&params).await?.items)
    }

    async fn create_record(&self, record: &ConfigMap) -> Result<()> {
        let name = record.name_any();
        if self.dry_run {
            info!(record = %name, data = ?record.data, "dry-run: would create coordination record");
            return Ok(());
        }
        match self.records().create(&PostParams::default(), record).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::AlreadyExists {
                kind: "ConfigMap",
                name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_record(&self, name: &str) -> Result<()> {
        if self.dry_run {
            info!(record = %name, "dry-run: would delete coordination record");
            return Ok(());
        }
        ignore_not_found(
            self.records()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_placeholder(&self, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments().get_opt(name).await?)
    }

    async fn list_placeholders(&self) -> Result<Vec<Deployment>> {
        Ok(self.deployments().list(&ListParams::default()).await?.items)
    }

    async fn apply_placeholder(&self, deployment: &Deployment) -> Result<()> {
        let name = deployment.name_any();
        if self.dry_run {
            info!(deployment = %name, "dry-run: would apply placeholder deployment");
            return Ok(());
        }
        self.deployments()
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(deployment),
            )
            .await?;
        Ok(())
    }

    async fn delete_placeholder(&self, name: &str) -> Result<()> {
        if self.dry_run {
            info!(deployment = %name, "dry-run: would delete placeholder deployment");
            return Ok(());
        }
        ignore_not_found(
            self.deployments()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_placeholder_pods(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(api.list(&params).await?.items)
    }
}
