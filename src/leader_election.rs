//! Lease-based leader election
//!
//! Every replica runs the control loops, but only the holder of the lease
//! reconciles; the others requeue until they take over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "pair-scheduler-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// True when nobody holds the lease or the holder stopped renewing it
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    let Some(renewed) = spec.renew_time.as_ref() else {
        return true;
    };
    let duration = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS);
    now > renewed.0 + chrono::Duration::seconds(i64::from(duration))
}

pub struct LeaderElector {
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, identity: &str, is_leader: Arc<AtomicBool>) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            is_leader,
        }
    }

    /// Acquires or renews the lease forever, publishing the outcome to `is_leader`
    pub async fn run(self) {
        loop {
            let leading = match self.try_acquire_or_renew().await {
                Ok(leading) => leading,
                Err(e) => {
                    warn!("Leader election error: {:?}", e);
                    false
                }
            };
            let was_leading = self.is_leader.swap(leading, Ordering::Relaxed);
            match (was_leading, leading) {
                (false, true) => info!("Acquired leadership for lease {}", LEASE_NAME),
                (true, false) => warn!("Lost leadership for lease {}", LEASE_NAME),
                _ => {}
            }
            tokio::time::sleep(if leading { RENEW_INTERVAL } else { RETRY_INTERVAL }).await;
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let Some(existing) = self.leases.get_opt(LEASE_NAME).await? else {
            return self.create(now).await;
        };
        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            let renew = json!({
                "spec": {
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            self.leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&renew))
                .await?;
            return Ok(true);
        }
        if !lease_expired(spec, now) {
            return Ok(false);
        }

        info!("Lease held by {:?} has expired, taking over", holder);
        // resourceVersion makes concurrent takeovers conflict instead of both winning
        let takeover = json!({
            "metadata": { "resourceVersion": existing.resource_version() },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION_SECS,
            }
        });
        conflict_is_loss(
            self.leases
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&takeover))
                .await
                .map(|_| ()),
        )
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool, kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                ..Default::default()
            }),
        };
        let created = conflict_is_loss(
            self.leases
                .create(&PostParams::default(), &lease)
                .await
                .map(|_| ()),
        )?;
        if created {
            info!("Created lease {} with holder {}", LEASE_NAME, self.identity);
        }
        Ok(created)
    }
}

/// A 409 means another replica won the race
fn conflict_is_loss(res: Result<(), kube::Error>) -> Result<bool, kube::Error> {
    match res {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e),
    }
}
