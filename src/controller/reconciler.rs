//! Runs the four control loops on kube-runtime controllers
//!
//! Each loop gets its own [`Context`] so that backoff and sizing validity
//! are tracked per loop. Only the scheduler, creator and reaper need to be
//! serialized; the updater touches one deployment per reconcile and may run
//! in parallel.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        reflector,
        watcher::{self, Config},
        WatchStreamExt,
    },
    ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::crd::{ClusterSizingConfiguration, HostedCluster, SIZING_CONFIGURATION_NAME};
use crate::error::{Error, Result};

use super::client::ClusterApi;
use super::context::Context;
use super::labels::{HOSTED_CLUSTER_LABEL, PAIR_LABEL_KEY, PLACEHOLDER_LABEL, REQUEST_SERVING_COMPONENT_LABEL};
use super::{placeholder_creator, placeholder_updater, reaper, scheduler, triggers};

/// How often a standby replica re-checks whether it has become leader
pub const STANDBY_REQUEUE: Duration = Duration::from_secs(5);

const UPDATER_CONCURRENCY: u16 = 10;

/// One context per loop
pub struct LoopContexts {
    pub scheduler: Arc<Context>,
    pub creator: Arc<Context>,
    pub updater: Arc<Context>,
    pub reaper: Arc<Context>,
}

impl LoopContexts {
    pub fn new(api: Arc<dyn ClusterApi>, placeholder_image: &str, is_leader: Arc<AtomicBool>) -> Self {
        let context = || Arc::new(Context::new(api.clone(), placeholder_image, is_leader.clone()));
        Self {
            scheduler: context(),
            creator: context(),
            updater: context(),
            reaper: context(),
        }
    }
}

/// Main entry point to start the controllers; returns when all of them have shut down
pub async fn run_controllers(client: Client, namespace: &str, contexts: LoopContexts) -> Result<()> {
    let tenants: Api<HostedCluster> = Api::all(client.clone());
    let configs: Api<ClusterSizingConfiguration> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let records: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);

    // Verify CRDs exist
    for (kind, probe) in [
        ("HostedCluster", tenants.list(&ListParams::default().limit(1)).await.map(|_| ())),
        (
            "ClusterSizingConfiguration",
            configs.list(&ListParams::default().limit(1)).await.map(|_| ()),
        ),
    ] {
        match probe {
            Ok(()) => info!("{} CRD is available", kind),
            Err(e) => {
                error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
                return Err(Error::ConfigError(format!("{kind} CRD not installed")));
            }
        }
    }

    let dedicated_nodes = Config::default().labels(REQUEST_SERVING_COMPONENT_LABEL);

    // Scheduler: tenants, plus node, placeholder and configuration triggers
    let (node_reader, node_writer) = reflector::store();
    let node_changes = watcher::watcher(nodes.clone(), dedicated_nodes.clone())
        .default_backoff()
        .reflect(node_writer)
        .touched_objects();
    let scheduler_controller = Controller::new(tenants.clone(), Config::default())
        .with_config(ControllerConfig::default().concurrency(1));
    let tenant_store = scheduler_controller.store();
    let scheduler_loop = scheduler_controller
        .watches_stream(node_changes, move |node| {
            let all = node_reader.state();
            triggers::tenant_for_node(&node, all.iter().map(|n| n.as_ref()))
        })
        .watches(deployments.clone(), Config::default(), |deployment| {
            triggers::tenant_for_placeholder(&deployment)
        })
        .watches(configs.clone(), Config::default(), move |_| {
            triggers::all_tenants(tenant_store.state().iter().map(|t| t.as_ref()))
        })
        .shutdown_on_signal()
        .run(reconcile_scheduler, scheduler_error_policy, contexts.scheduler)
        .for_each(log_outcome(scheduler::CONTROLLER));

    // Creator: keyed on the singleton configuration
    let creator_loop = Controller::new(
        configs.clone(),
        Config::default().fields(&format!("metadata.name={SIZING_CONFIGURATION_NAME}")),
    )
    .with_config(ControllerConfig::default().concurrency(1))
    .watches(deployments.clone(), Config::default(), |_| {
        Some(triggers::creator_key())
    })
    .watches(records, Config::default().labels(PAIR_LABEL_KEY), |_| {
        Some(triggers::creator_key())
    })
    .shutdown_on_signal()
    .run(reconcile_creator, creator_error_policy, contexts.creator)
    .for_each(log_outcome(placeholder_creator::CONTROLLER));

    // Updater: warm-pool deployments, re-enqueued on configuration and node changes
    let updater_controller = Controller::new(deployments, Config::default().labels(PLACEHOLDER_LABEL))
        .with_config(ControllerConfig::default().concurrency(UPDATER_CONCURRENCY));
    let on_config = updater_controller.store();
    let on_node = on_config.clone();
    let updater_loop = updater_controller
        .watches(configs, Config::default(), move |_| {
            triggers::warm_pool_deployments(on_config.state().iter().map(|d| d.as_ref()))
        })
        .watches(nodes.clone(), dedicated_nodes, move |_| {
            triggers::warm_pool_deployments(on_node.state().iter().map(|d| d.as_ref()))
        })
        .shutdown_on_signal()
        .run(reconcile_updater, updater_error_policy, contexts.updater)
        .for_each(log_outcome(placeholder_updater::CONTROLLER));

    // Reaper: claimed dedicated nodes, re-enqueued when their tenant changes
    let reaper_controller = Controller::new(
        nodes,
        Config::default().labels(&format!(
            "{REQUEST_SERVING_COMPONENT_LABEL},{HOSTED_CLUSTER_LABEL}"
        )),
    )
    .with_config(ControllerConfig::default().concurrency(1));
    let claimed_nodes = reaper_controller.store();
    let reaper_loop = reaper_controller
        .watches(tenants, Config::default(), move |tenant| {
            triggers::nodes_for_tenant(&tenant, claimed_nodes.state().iter().map(|n| n.as_ref()))
        })
        .shutdown_on_signal()
        .run(reconcile_reaper, reaper_error_policy, contexts.reaper)
        .for_each(log_outcome(reaper::CONTROLLER));

    info!("Starting controllers");
    info!("- {}", scheduler::CONTROLLER);
    info!("- {}", placeholder_creator::CONTROLLER);
    info!("- {}", placeholder_updater::CONTROLLER);
    info!("- {}", reaper::CONTROLLER);

    futures::join!(scheduler_loop, creator_loop, updater_loop, reaper_loop);
    info!("Controllers shut down");
    Ok(())
}

fn log_outcome<T: Debug, E: Debug>(
    controller: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> futures::future::Ready<()> {
    move |res| {
        match res {
            Ok(obj) => debug!(controller, "Reconciled: {:?}", obj),
            Err(e) => warn!(controller, "Reconcile error: {:?}", e),
        }
        futures::future::ready(())
    }
}

/// Runs `reconcile` if this replica leads, timing it and clearing backoff on success
async fn leading<F>(ctx: &Context, controller: &'static str, key: &str, reconcile: F) -> Result<Action>
where
    F: Future<Output = Result<Action>>,
{
    if !ctx.is_leader() {
        debug!(controller, "Not leader, standing by");
        return Ok(Action::requeue(STANDBY_REQUEUE));
    }
    let started = Instant::now();
    let result = reconcile.await;
    let elapsed = started.elapsed();
    debug!(controller, key, elapsed_ms = elapsed.as_millis() as u64, "Reconcile finished");
    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(controller, elapsed.as_secs_f64());
    if result.is_ok() {
        ctx.backoff.reset(key);
    }
    result
}

/// Per-object exponential backoff; transient failures log at info, structural ones at error
fn backoff(ctx: &Context, controller: &'static str, key: &str, error: &Error) -> Action {
    if error.is_retriable() {
        info!(controller, key, error = %error, "Reconcile failed, retrying");
    } else {
        error!(controller, key, error = %error, "Reconcile failed");
    }
    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(controller, error.kind());
    Action::requeue(ctx.backoff.next_delay(key))
}

fn tenant_key(tenant: &HostedCluster) -> String {
    format!("{}/{}", tenant.namespace().unwrap_or_default(), tenant.name_any())
}

async fn reconcile_scheduler(tenant: Arc<HostedCluster>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = tenant.namespace().unwrap_or_default();
    let name = tenant.name_any();
    leading(
        &ctx,
        scheduler::CONTROLLER,
        &tenant_key(&tenant),
        scheduler::reconcile_tenant(&ctx, &namespace, &name),
    )
    .await
}

fn scheduler_error_policy(tenant: Arc<HostedCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff(&ctx, scheduler::CONTROLLER, &tenant_key(&tenant), error)
}

async fn reconcile_creator(
    config: Arc<ClusterSizingConfiguration>,
    ctx: Arc<Context>,
) -> Result<Action> {
    leading(
        &ctx,
        placeholder_creator::CONTROLLER,
        &config.name_any(),
        placeholder_creator::reconcile_warm_pool(&ctx),
    )
    .await
}

fn creator_error_policy(
    config: Arc<ClusterSizingConfiguration>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    backoff(&ctx, placeholder_creator::CONTROLLER, &config.name_any(), error)
}

async fn reconcile_updater(deployment: Arc<Deployment>, ctx: Arc<Context>) -> Result<Action> {
    let name = deployment.name_any();
    leading(
        &ctx,
        placeholder_updater::CONTROLLER,
        &name,
        placeholder_updater::reconcile_warm_pool_deployment(&ctx, &name),
    )
    .await
}

fn updater_error_policy(deployment: Arc<Deployment>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff(&ctx, placeholder_updater::CONTROLLER, &deployment.name_any(), error)
}

async fn reconcile_reaper(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    let name = node.name_any();
    leading(&ctx, reaper::CONTROLLER, &name, reaper::reconcile_node(&ctx, &name)).await
}

fn reaper_error_policy(node: Arc<Node>, error: &Error, ctx: Arc<Context>) -> Action {
    backoff(&ctx, reaper::CONTROLLER, &node.name_any(), error)
}
