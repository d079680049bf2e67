//! Finalizer handling for HostedCluster cleanup
//!
//! Two finalizers coexist on a dedicated tenant:
//! 1. The hosted-cluster finalizer, owned by the hosted-cluster reconciler
//! 2. The scheduler finalizer, which holds the tenant until its placeholder
//!    and coordination records are gone
//!
//! The scheduler only cleans up once the first one has been removed.

use kube::ResourceExt;
use tracing::info;

use crate::crd::HostedCluster;
use crate::error::Result;

use super::client::ClusterApi;
use super::labels::{HOSTED_CLUSTER_FINALIZER, SCHEDULER_FINALIZER};

pub fn has_finalizer(tenant: &HostedCluster, finalizer: &str) -> bool {
    tenant.finalizers().iter().any(|f| f == finalizer)
}

pub fn has_scheduler_finalizer(tenant: &HostedCluster) -> bool {
    has_finalizer(tenant, SCHEDULER_FINALIZER)
}

/// The hosted-cluster reconciler has not finished tearing the tenant down
pub fn awaiting_hosted_cluster_teardown(tenant: &HostedCluster) -> bool {
    has_finalizer(tenant, HOSTED_CLUSTER_FINALIZER)
}

/// Add the scheduler finalizer if not present
pub async fn add_finalizer(api: &dyn ClusterApi, tenant: &HostedCluster) -> Result<()> {
    if has_scheduler_finalizer(tenant) {
        return Ok(());
    }
    let mut finalizers = tenant.finalizers().to_vec();
    finalizers.push(SCHEDULER_FINALIZER.to_string());
    api.set_tenant_finalizers(tenant, finalizers).await?;
    info!(
        "Added scheduler finalizer to HostedCluster: {}/{}",
        tenant.namespace().unwrap_or_default(),
        tenant.name_any()
    );
    Ok(())
}

/// Remove the scheduler finalizer after cleanup is complete
pub async fn remove_finalizer(api: &dyn ClusterApi, tenant: &HostedCluster) -> Result<()> {
    let finalizers: Vec<String> = tenant
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SCHEDULER_FINALIZER)
        .cloned()
        .collect();
    api.set_tenant_finalizers(tenant, finalizers).await?;
    info!(
        "Removed scheduler finalizer from HostedCluster: {}/{}",
        tenant.namespace().unwrap_or_default(),
        tenant.name_any()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{dedicated_tenant, FakeCluster};

    #[test]
    fn test_finalizer_names() {
        assert_eq!(
            SCHEDULER_FINALIZER,
            "hypershift.openshift.io/dedicated-request-serving-scheduler"
        );
        assert_eq!(HOSTED_CLUSTER_FINALIZER, "hypershift.openshift.io/finalizer");
    }

    #[tokio::test]
    async fn test_add_then_remove_keeps_foreign_finalizers() {
        let cluster = FakeCluster::new();
        let mut tenant = dedicated_tenant("T", "c", Some("small"));
        tenant.metadata.finalizers = Some(vec![HOSTED_CLUSTER_FINALIZER.to_string()]);
        cluster.put_tenant(tenant);

        let tenant = cluster.tenant("T", "c").unwrap();
        add_finalizer(&cluster, &tenant).await.unwrap();
        let tenant = cluster.tenant("T", "c").unwrap();
        assert!(has_scheduler_finalizer(&tenant));
        assert!(awaiting_hosted_cluster_teardown(&tenant));

        remove_finalizer(&cluster, &tenant).await.unwrap();
        let tenant = cluster.tenant("T", "c").unwrap();
        assert_eq!(
            tenant.finalizers(),
            &[HOSTED_CLUSTER_FINALIZER.to_string()]
        );
    }
}
