//! Binds each dedicated tenant to exactly one pair of request-serving nodes
//!
//! One pass over a tenant walks, in order:
//! deletion cleanup, preconditions, the finalizer, backfill of a pair the
//! tenant already holds, a claim from a ready placeholder, the goal check
//! with annotation projection, and finally the tenant placeholder that pulls
//! new nodes into existence. Every write returns to the controller so the
//! next pass starts from fresh state.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{ClusterSizingConfiguration, HostedCluster};
use crate::error::{Error, Result};

use super::client::ClusterApi;
use super::context::Context;
use super::finalizers::{
    add_finalizer, awaiting_hosted_cluster_teardown, has_scheduler_finalizer, remove_finalizer,
};
use super::nodes::{self, claim_node, claimed_pair_labels, zones, TenantNodes};
use super::pair_record::{delete_records_for, ensure_record, pairs_owned_by, RecordOwner};
use super::placeholder::{is_deployment_ready, pod_selector, tenant_deployment, Placeholder};
use super::sizing::{annotation_changes, scheduling_annotations, usable_configuration};
use super::tenant::{pause_state, PauseState};

pub const CONTROLLER: &str = "scheduler";

/// Delay before re-reading state after a claim or label write
pub const REQUEUE_AFTER_WRITE: Duration = Duration::from_secs(1);

/// How often a tenant still waiting on nodes is looked at again
pub const PENDING_RECHECK: Duration = Duration::from_secs(60);

/// Which path bound a pair to the tenant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClaimPath {
    TenantPlaceholder,
    WarmPool,
}

impl ClaimPath {
    fn as_str(self) -> &'static str {
        match self {
            ClaimPath::TenantPlaceholder => "tenant_placeholder",
            ClaimPath::WarmPool => "warm_pool",
        }
    }
}

/// Reconciles one tenant
#[instrument(skip(ctx), fields(tenant = %format!("{namespace}/{name}")))]
pub async fn reconcile_tenant(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let api = ctx.api();
    let Some(tenant) = api.get_tenant(namespace, name).await? else {
        debug!("HostedCluster not found, nothing to do");
        return Ok(Action::await_change());
    };
    let owner = RecordOwner::new(namespace, name);

    if tenant.is_being_deleted() {
        return cleanup(api, &tenant, &owner).await;
    }

    if !tenant.is_dedicated_request_serving() {
        debug!("HostedCluster does not use dedicated request serving nodes");
        return Ok(Action::await_change());
    }

    if !has_scheduler_finalizer(&tenant) {
        add_finalizer(api, &tenant).await?;
        return Ok(Action::await_change());
    }

    match pause_state(tenant.spec.paused_until.as_deref(), Utc::now()) {
        Ok(PauseState::Running) => {}
        Ok(PauseState::Indefinite) => {
            info!("Reconciliation paused");
            return Ok(Action::await_change());
        }
        Ok(PauseState::Until(remaining)) => {
            info!(remaining_secs = remaining.as_secs(), "Reconciliation paused");
            return Ok(Action::requeue(remaining));
        }
        Err(e) => {
            // Retrying cannot fix a malformed value; wait for the user to change it
            error!(error = %e, "Could not interpret pausedUntil");
            return Ok(Action::await_change());
        }
    }

    let Some(desired_size) = tenant.desired_size() else {
        debug!("HostedCluster has no desired size yet");
        return Ok(Action::await_change());
    };

    let Some(config) = usable_configuration(api, &ctx.validity, CONTROLLER).await? else {
        return Ok(Action::await_change());
    };
    if config.size(desired_size).is_none() {
        return Err(Error::UnknownSizeClass(desired_size.to_string()));
    }

    schedule(ctx, &tenant, &owner, desired_size, &config).await
}

/// Releases what the tenant holds once the hosted-cluster teardown is done
async fn cleanup(api: &dyn ClusterApi, tenant: &HostedCluster, owner: &RecordOwner) -> Result<Action> {
    if !has_scheduler_finalizer(tenant) {
        return Ok(Action::await_change());
    }
    if awaiting_hosted_cluster_teardown(tenant) {
        info!("Waiting for the hosted cluster finalizer to be removed");
        return Ok(Action::await_change());
    }

    api.delete_placeholder(&tenant.cluster_key()).await?;
    let deleted = delete_records_for(api, owner).await?;
    info!(records = deleted, "Released placeholder and coordination records");
    remove_finalizer(api, tenant).await?;
    Ok(Action::await_change())
}

async fn schedule(
    ctx: &Context,
    tenant: &HostedCluster,
    owner: &RecordOwner,
    desired_size: &str,
    config: &ClusterSizingConfiguration,
) -> Result<Action> {
    let api = ctx.api();
    let key = tenant.cluster_key();
    let (namespace, name) = (owner.namespace.as_str(), owner.name.as_str());

    let all_nodes = api.list_dedicated_nodes().await?;
    let view = TenantNodes::classify(&all_nodes, &key, desired_size);
    if view.owned_sized.len() > 2 {
        return Err(Error::InvariantViolation(format!(
            "found {} dedicated nodes of size {desired_size} for hosted cluster {key}, expected at most 2",
            view.owned_sized.len()
        )));
    }

    let records = api.list_records().await?;
    let pair = match view.pair_label() {
        Some(pair) => Some(pair.to_string()),
        None => recorded_pair(&records, owner, &all_nodes, desired_size),
    };

    match &pair {
        Some(pair) => {
            ensure_record(api, pair, owner).await.map_err(|e| match e {
                Error::PairConflict { pair_label, owner } => Error::InvariantViolation(format!(
                    "nodes of pair {pair_label} are labeled for {key} but the pair is recorded for {owner}"
                )),
                other => other,
            })?;

            let candidates = view.backfill_candidates(pair, desired_size);
            let mut labeled = false;
            for node in candidates {
                labeled |= claim_node(api, node, namespace, name).await?;
            }
            if labeled {
                info!(pair_label = %pair, "Backfilled node labels");
                #[cfg(feature = "metrics")]
                super::metrics::inc_pair_claim("backfill");
                return Ok(Action::requeue(REQUEUE_AFTER_WRITE));
            }
        }
        None => {
            if claim_from_placeholders(ctx, tenant, owner, desired_size, config, &all_nodes).await? {
                return Ok(Action::requeue(REQUEUE_AFTER_WRITE));
            }
        }
    }

    let goal = pair.as_deref().map(|p| view.goal(p)).unwrap_or_default();
    let covered = zones(goal.iter().copied());
    if covered.len() >= 2 {
        info!(pair_label = ?pair, "Sufficient nodes exist for placement");
        let desired = scheduling_annotations(tenant.annotations(), desired_size, config, &goal)?;
        let changes = annotation_changes(tenant.annotations(), &desired);
        if !changes.is_empty() {
            api.patch_tenant_annotations(tenant, &changes).await?;
            info!(changed = changes.len(), "Projected scheduling annotations");
        }
        if api.get_placeholder(&key).await?.is_some() {
            api.delete_placeholder(&key).await?;
            #[cfg(feature = "metrics")]
            super::metrics::inc_placeholder_operation("tenant", "delete");
        }
        return Ok(Action::await_change());
    }

    let nodes_needed = 2i32.saturating_sub(covered.len() as i32).max(0);
    let excluded = match pair {
        Some(_) => BTreeSet::new(),
        None => claimed_pair_labels(&all_nodes, &records),
    };
    let placeholder = tenant_deployment(
        api.placeholder_namespace(),
        &ctx.placeholder_image,
        namespace,
        name,
        desired_size,
        pair.as_deref(),
        &excluded,
        nodes_needed,
    );
    api.apply_placeholder(&placeholder).await?;
    info!(nodes_needed, pair_label = ?pair, "Deployed placeholder to request nodes");
    #[cfg(feature = "metrics")]
    super::metrics::inc_placeholder_operation("tenant", "apply");
    Ok(Action::requeue(PENDING_RECHECK))
}

/// The first pair recorded for the tenant whose nodes, if any exist yet,
/// all have the desired size. A pair of an older size is skipped so that a
/// resized tenant is not pinned to nodes it can no longer use.
fn recorded_pair(
    records: &[ConfigMap],
    owner: &RecordOwner,
    all_nodes: &[Node],
    desired_size: &str,
) -> Option<String> {
    pairs_owned_by(records, owner).into_iter().find(|pair| {
        all_nodes
            .iter()
            .filter(|n| nodes::pair_label(n) == Some(pair.as_str()))
            .all(|n| nodes::size(n) == Some(desired_size))
    })
}

/// Tries the ready placeholders that could hand the tenant a pair.
///
/// The tenant's own placeholder is tried first, then ready warm-pool
/// deployments of the desired size by name. A candidate whose pair another
/// tenant has recorded is skipped. Returns true once a pair was claimed.
async fn claim_from_placeholders(
    ctx: &Context,
    tenant: &HostedCluster,
    owner: &RecordOwner,
    desired_size: &str,
    config: &ClusterSizingConfiguration,
    all_nodes: &[Node],
) -> Result<bool> {
    let api = ctx.api();
    let key = tenant.cluster_key();

    let mut deployments = api.list_placeholders().await?;
    deployments.sort_by_key(|d| d.name_any());

    let mut candidates: Vec<(&Deployment, ClaimPath)> = Vec::new();
    for deployment in deployments.iter().filter(|d| is_deployment_ready(d)) {
        match Placeholder::classify(deployment) {
            Placeholder::TenantOwned { namespace, name }
                if namespace == owner.namespace && name == owner.name =>
            {
                candidates.insert(0, (deployment, ClaimPath::TenantPlaceholder));
            }
            Placeholder::WarmPool { size, .. }
                if size == desired_size && config.placeholders_for(desired_size) > 0 =>
            {
                candidates.push((deployment, ClaimPath::WarmPool));
            }
            _ => {}
        }
    }

    for (deployment, path) in candidates {
        let placeholder_nodes = scheduled_nodes(api, deployment, all_nodes).await?;
        let Some(pair) = usable_pair(&placeholder_nodes, &key, desired_size, path) else {
            debug!(deployment = %deployment.name_any(), "Placeholder nodes do not form a usable pair");
            continue;
        };

        match ensure_record(api, &pair, owner).await {
            Ok(()) => {}
            Err(Error::PairConflict { owner: holder, .. }) => {
                warn!(
                    deployment = %deployment.name_any(),
                    pair_label = %pair,
                    holder = %holder,
                    "Pair already claimed by another tenant, trying next placeholder"
                );
                #[cfg(feature = "metrics")]
                super::metrics::inc_pair_claim_conflict();
                continue;
            }
            Err(e) => return Err(e),
        }

        for node in &placeholder_nodes {
            claim_node(api, node, &owner.namespace, &owner.name).await?;
        }
        api.delete_placeholder(&deployment.name_any()).await?;
        info!(
            deployment = %deployment.name_any(),
            pair_label = %pair,
            path = path.as_str(),
            "Claimed node pair from placeholder"
        );
        #[cfg(feature = "metrics")]
        {
            super::metrics::inc_pair_claim(path.as_str());
            let flavor = match path {
                ClaimPath::TenantPlaceholder => "tenant",
                ClaimPath::WarmPool => "warm_pool",
            };
            super::metrics::inc_placeholder_operation(flavor, "delete");
        }
        return Ok(true);
    }
    Ok(false)
}

/// Nodes the deployment's pods are running on
async fn scheduled_nodes(
    api: &dyn ClusterApi,
    deployment: &Deployment,
    all_nodes: &[Node],
) -> Result<Vec<Node>> {
    let pods = api.list_placeholder_pods(&pod_selector(deployment)).await?;
    let names: BTreeSet<String> = pods
        .iter()
        .filter_map(|p| p.spec.as_ref()?.node_name.clone())
        .collect();
    Ok(all_nodes
        .iter()
        .filter(|n| names.contains(&n.name_any()))
        .cloned()
        .collect())
}

/// The pair label shared by all `nodes`, if they can be handed to the tenant.
///
/// Every node must share one non-empty pair label, have the desired size and
/// be unclaimed or already claimed by this tenant. Warm-pool pairs must also
/// span two zones.
fn usable_pair(nodes: &[Node], key: &str, desired_size: &str, path: ClaimPath) -> Option<String> {
    let first = nodes.first()?;
    let pair = nodes::pair_label(first)?;
    let consistent = nodes.iter().all(|n| {
        nodes::pair_label(n) == Some(pair)
            && nodes::size(n) == Some(desired_size)
            && !nodes::is_deleting(n)
            && nodes::owner_key(n).map_or(true, |owner| owner == key)
    });
    if !consistent {
        return None;
    }
    if path == ClaimPath::WarmPool && zones(nodes.iter()).len() < 2 {
        return None;
    }
    Some(pair.to_string())
}
