//! Keeps warm-pool deployments steering clear of claimed pairs
//!
//! Every warm-pool deployment carries a `NotIn` node affinity over the
//! claimed pair labels. When pairs are claimed or released that set drifts,
//! and the deployment is re-applied so its pods move to a free pair. Surplus
//! indices left after the configured count shrinks are deleted here.

use kube::runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;

use super::context::Context;
use super::nodes::claimed_pair_labels;
use super::placeholder::{excluded_pair_labels, warm_pool_deployment, Placeholder};
use super::sizing::usable_configuration;

pub const CONTROLLER: &str = "placeholder-updater";

#[instrument(skip(ctx))]
pub async fn reconcile_warm_pool_deployment(ctx: &Context, name: &str) -> Result<Action> {
    let api = ctx.api();
    let Some(config) = usable_configuration(api, &ctx.validity, CONTROLLER).await? else {
        return Ok(Action::await_change());
    };
    let Some(deployment) = api.get_placeholder(name).await? else {
        return Ok(Action::await_change());
    };

    let (size, index) = match Placeholder::classify(&deployment) {
        Placeholder::WarmPool { size, index } => (size, index),
        Placeholder::TenantOwned { .. } => {
            debug!("Tenant placeholders are managed by the scheduler");
            return Ok(Action::await_change());
        }
        Placeholder::Unrecognized { reason } => {
            warn!(%reason, "Ignoring unrecognized deployment in placeholder namespace");
            return Ok(Action::await_change());
        }
    };

    let wanted = config.placeholders_for(&size);
    if index >= wanted {
        api.delete_placeholder(name).await?;
        info!(size = %size, index, wanted, "Deleted surplus warm-pool placeholder");
        #[cfg(feature = "metrics")]
        super::metrics::inc_placeholder_operation("warm_pool", "delete");
        return Ok(Action::await_change());
    }

    let nodes = api.list_dedicated_nodes().await?;
    let records = api.list_records().await?;
    let excluded = claimed_pair_labels(&nodes, &records);
    if excluded_pair_labels(&deployment) == excluded {
        return Ok(Action::await_change());
    }

    let updated = warm_pool_deployment(
        api.placeholder_namespace(),
        &ctx.placeholder_image,
        &size,
        index,
        &excluded,
    );
    api.apply_placeholder(&updated).await?;
    info!(excluded = ?excluded, "Updated warm-pool placeholder exclusions");
    #[cfg(feature = "metrics")]
    super::metrics::inc_placeholder_operation("warm_pool", "apply");
    Ok(Action::await_change())
}
