//! Shared types for the custom resources read by the scheduler

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Standard Kubernetes condition, as carried in `status.conditions`
///
/// # Examples
///
/// ```rust,no_run
/// use pair_scheduler::crd::Condition;
///
/// let condition = Condition::new("ClusterSizingConfigurationValid", true, "AsExpected", "");
/// assert!(condition.is_true());
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, e.g. "ClusterSizingConfigurationValid"
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
