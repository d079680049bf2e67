//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{error, instrument};

use crate::controller::pair_record::{record_owner, record_pair_label};
use crate::controller::Context;

use super::dto::{ErrorResponse, HealthResponse, PairListResponse, PairSummary, ReadinessResponse};

/// Liveness endpoint
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness endpoint
///
/// A standby replica is ready as soon as it serves. The leader is ready once
/// the scheduler has observed a valid sizing configuration.
#[instrument(skip(state))]
pub async fn readyz(
    State(state): State<Arc<Context>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let leader = state.is_leader();
    let valid = state.validity.is_usable();
    let ready = !leader || valid;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            leader,
            sizing_configuration_valid: valid,
        }),
    )
}

/// List coordination records, sorted by pair label
#[instrument(skip(state))]
pub async fn list_pairs(
    State(state): State<Arc<Context>>,
) -> Result<Json<PairListResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.api().list_records().await {
        Ok(records) => {
            let mut items: Vec<PairSummary> = records
                .iter()
                .map(|record| {
                    let owner = record_owner(record);
                    PairSummary {
                        pair_label: record_pair_label(record),
                        cluster_namespace: owner.namespace,
                        cluster_name: owner.name,
                    }
                })
                .collect();
            items.sort_by(|a, b| a.pair_label.cmp(&b.pair_label));
            let total = items.len();
            Ok(Json(PairListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list pair records: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}
