//! Controller module for dedicated request-serving node scheduling
//!
//! Four loops share this module: the scheduler binds tenants to node pairs,
//! the placeholder creator and updater keep the warm pool filled and clear of
//! claimed pairs, and the reaper deletes nodes whose tenant is gone.

mod backoff;
pub mod client;
mod context;
mod finalizers;
pub mod labels;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod nodes;
pub mod pair_record;
pub mod placeholder;
pub mod placeholder_creator;
pub mod placeholder_updater;
pub mod reaper;
mod reconciler;
pub mod scheduler;
pub mod sizing;
pub mod tenant;
#[cfg(test)]
pub(crate) mod testing;
pub mod triggers;

pub use backoff::{Backoff, INITIAL_BACKOFF, MAX_BACKOFF};
pub use client::{ClusterApi, KubeClusterApi};
pub use context::Context;
pub use finalizers::has_scheduler_finalizer;
pub use pair_record::RecordOwner;
pub use placeholder::Placeholder;
pub use reconciler::{run_controllers, LoopContexts, STANDBY_REQUEUE};
pub use sizing::ValidityTracker;
