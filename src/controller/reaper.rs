//! Deletes claimed nodes whose tenant no longer exists
//!
//! Claim labels are never removed from a node. Once its tenant is gone the
//! whole node is deleted and the fleet manager provisions a fresh one.

use kube::runtime::controller::Action;
use tracing::{debug, info, instrument};

use crate::error::Result;

use super::context::Context;
use super::nodes::{is_dedicated, owner, owner_key};

pub const CONTROLLER: &str = "node-reaper";

#[instrument(skip(ctx))]
pub async fn reconcile_node(ctx: &Context, name: &str) -> Result<Action> {
    let api = ctx.api();
    let Some(node) = api.get_node(name).await? else {
        return Ok(Action::await_change());
    };
    if !is_dedicated(&node) || owner_key(&node).is_none() {
        return Ok(Action::await_change());
    }
    let Some((tenant_namespace, tenant_name)) = owner(&node) else {
        debug!("Claimed node lacks tenant name or namespace labels");
        return Ok(Action::await_change());
    };

    if api.get_tenant(tenant_namespace, tenant_name).await?.is_some() {
        return Ok(Action::await_change());
    }

    api.delete_node(name).await?;
    info!(
        tenant = %format!("{tenant_namespace}/{tenant_name}"),
        "Deleted node whose hosted cluster no longer exists"
    );
    #[cfg(feature = "metrics")]
    super::metrics::inc_reaped_node();
    Ok(Action::await_change())
}
