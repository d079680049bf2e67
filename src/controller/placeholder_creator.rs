//! Keeps each size class's warm pool filled
//!
//! At most one warm-pool deployment is created per pass so that each new
//! placeholder's pair shows up in the exclusion set of the next.

use std::collections::BTreeSet;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::error::Result;

use super::context::Context;
use super::labels::{HOSTED_CLUSTER_SIZE_LABEL, PLACEHOLDER_LABEL};
use super::nodes::claimed_pair_labels;
use super::placeholder::{parse_index, warm_pool_deployment, warm_pool_name};
use super::scheduler::REQUEUE_AFTER_WRITE;
use super::sizing::usable_configuration;

pub const CONTROLLER: &str = "placeholder-creator";

/// Smallest index not in use
pub fn smallest_missing_index(existing: &BTreeSet<u32>) -> u32 {
    (0..).find(|i| !existing.contains(i)).unwrap_or(0)
}

#[instrument(skip(ctx))]
pub async fn reconcile_warm_pool(ctx: &Context) -> Result<Action> {
    let api = ctx.api();
    let Some(config) = usable_configuration(api, &ctx.validity, CONTROLLER).await? else {
        return Ok(Action::await_change());
    };

    let deployments = api.list_placeholders().await?;
    for size_class in config.spec.sizes.iter().filter(|s| s.placeholders() > 0) {
        let size = size_class.name.as_str();
        let indices = deployments
            .iter()
            .filter(|d| d.labels().contains_key(PLACEHOLDER_LABEL))
            .filter(|d| d.labels().get(HOSTED_CLUSTER_SIZE_LABEL).map(String::as_str) == Some(size))
            .map(|d| parse_index(size, &d.name_any()))
            .collect::<Result<BTreeSet<u32>>>()?;

        let wanted = size_class.placeholders();
        if indices.len() >= wanted as usize {
            debug!(size, existing = indices.len(), wanted, "Warm pool is full");
            continue;
        }

        let index = smallest_missing_index(&indices);
        let nodes = api.list_dedicated_nodes().await?;
        let records = api.list_records().await?;
        let excluded = claimed_pair_labels(&nodes, &records);

        let deployment = warm_pool_deployment(
            api.placeholder_namespace(),
            &ctx.placeholder_image,
            size,
            index,
            &excluded,
        );
        api.apply_placeholder(&deployment).await?;
        info!(
            deployment = %warm_pool_name(size, index),
            excluded = excluded.len(),
            "Created warm-pool placeholder"
        );
        #[cfg(feature = "metrics")]
        super::metrics::inc_placeholder_operation("warm_pool", "apply");
        return Ok(Action::requeue(REQUEUE_AFTER_WRITE));
    }

    Ok(Action::await_change())
}
