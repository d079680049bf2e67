//! Per-loop controller state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::backoff::Backoff;
use super::client::ClusterApi;
use super::labels::DEFAULT_PLACEHOLDER_IMAGE;
use super::sizing::ValidityTracker;

/// State handed to one control loop's reconcile and error policy
pub struct Context {
    pub api: Arc<dyn ClusterApi>,
    pub placeholder_image: String,
    /// Shared with the leader-election task; loops stand by while false
    pub is_leader: Arc<AtomicBool>,
    pub validity: ValidityTracker,
    pub backoff: Backoff,
}

impl Context {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        placeholder_image: impl Into<String>,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            api,
            placeholder_image: placeholder_image.into(),
            is_leader,
            validity: ValidityTracker::new(),
            backoff: Backoff::new(),
        }
    }

    /// Context for tests: always leader, default image
    pub fn standalone(api: Arc<dyn ClusterApi>) -> Self {
        Self::new(api, DEFAULT_PLACEHOLDER_IMAGE, Arc::new(AtomicBool::new(true)))
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }
}
