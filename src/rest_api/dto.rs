//! Response bodies for the REST API

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness as seen by this replica
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub leader: bool,
    pub sizing_configuration_valid: bool,
}

/// One coordination record: a pair label and the tenant holding it
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PairSummary {
    pub pair_label: String,
    pub cluster_namespace: String,
    pub cluster_name: String,
}

#[derive(Debug, Serialize)]
pub struct PairListResponse {
    pub items: Vec<PairSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
