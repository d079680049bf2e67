//! Sizing effects projected onto tenants
//!
//! Once a tenant holds a pair of nodes in two zones, everything the
//! scheduling decision implies for its control plane is written onto the
//! tenant object in one patch: the scheduled marker, the size-class effects,
//! and the values the selected nodes advertise through their labels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tracing::info;

use crate::crd::{ClusterSizingConfiguration, Effects, ResourceRequest};
use crate::error::{Error, Result};

use super::client::ClusterApi;
use super::labels::{
    API_CRITICAL_PRIORITY_CLASS_ANNOTATION, CONTROL_PLANE_PRIORITY_CLASS_ANNOTATION,
    ETCD_PRIORITY_CLASS_ANNOTATION, GO_MEM_LIMIT_LABEL, KAS_GO_MEM_LIMIT_ANNOTATION,
    LB_SUBNETS_ANNOTATION, LB_SUBNETS_LABEL, LB_TARGET_NODES_ANNOTATION,
    MACHINE_HEALTH_CHECK_TIMEOUT_ANNOTATION, MAX_MUTATING_REQUESTS_INFLIGHT_ANNOTATION,
    MAX_REQUESTS_INFLIGHT_ANNOTATION, NODE_ADDITIONAL_SELECTOR_ANNOTATION, NODE_SIZE_LABEL,
    PAIRED_NODES_LABEL, RESOURCE_REQUEST_OVERRIDE_PREFIX, SCHEDULED_ANNOTATION,
};
use super::nodes;

/// Computes the tenant's annotations after projecting the scheduling result.
///
/// The projection is a pure function of its inputs, so projecting onto its
/// own output changes nothing.
pub fn scheduling_annotations(
    current: &BTreeMap<String, String>,
    size: &str,
    config: &ClusterSizingConfiguration,
    selected: &[&Node],
) -> Result<BTreeMap<String, String>> {
    let size_config = config
        .size(size)
        .ok_or_else(|| Error::UnknownSizeClass(size.to_string()))?;
    let effects = size_config.effects.clone().unwrap_or_default();

    let mut annotations = current.clone();
    annotations.insert(SCHEDULED_ANNOTATION.to_string(), "true".to_string());

    let node_mem_limit = first_label(selected, GO_MEM_LIMIT_LABEL);
    set_or_clear(
        &mut annotations,
        KAS_GO_MEM_LIMIT_ANNOTATION,
        node_mem_limit.or(effects.kas_go_mem_limit.clone()),
    );
    project_effects(&mut annotations, &effects)?;

    if let Some(subnets) = first_label(selected, LB_SUBNETS_LABEL) {
        annotations.insert(LB_SUBNETS_ANNOTATION.to_string(), subnets.replace('.', ","));
    }
    if let Some(pair) = first_label(selected, PAIRED_NODES_LABEL) {
        annotations.insert(
            LB_TARGET_NODES_ANNOTATION.to_string(),
            format!("{PAIRED_NODES_LABEL}={pair}"),
        );
    }
    if !selected.is_empty() {
        annotations.insert(
            NODE_ADDITIONAL_SELECTOR_ANNOTATION.to_string(),
            format!("{NODE_SIZE_LABEL}={size}"),
        );
    }
    Ok(annotations)
}

fn project_effects(annotations: &mut BTreeMap<String, String>, effects: &Effects) -> Result<()> {
    set_or_clear(
        annotations,
        CONTROL_PLANE_PRIORITY_CLASS_ANNOTATION,
        effects.control_plane_priority_class_name.clone(),
    );
    set_or_clear(
        annotations,
        ETCD_PRIORITY_CLASS_ANNOTATION,
        effects.etcd_priority_class_name.clone(),
    );
    set_or_clear(
        annotations,
        API_CRITICAL_PRIORITY_CLASS_ANNOTATION,
        effects.api_critical_priority_class_name.clone(),
    );
    set_or_clear(
        annotations,
        MAX_REQUESTS_INFLIGHT_ANNOTATION,
        effects.maximum_requests_inflight.map(|v| v.to_string()),
    );
    set_or_clear(
        annotations,
        MAX_MUTATING_REQUESTS_INFLIGHT_ANNOTATION,
        effects.maximum_mutating_requests_inflight.map(|v| v.to_string()),
    );

    let timeout = effects
        .machine_health_check_timeout
        .as_deref()
        .map(|raw| {
            parse_go_duration(raw).map(format_go_duration).ok_or_else(|| {
                Error::ConfigError(format!("invalid machineHealthCheckTimeout {raw:?}"))
            })
        })
        .transpose()?;
    set_or_clear(annotations, MACHINE_HEALTH_CHECK_TIMEOUT_ANNOTATION, timeout);

    let override_prefix = format!("{RESOURCE_REQUEST_OVERRIDE_PREFIX}/");
    annotations.retain(|k, _| !k.starts_with(&override_prefix));
    annotations.extend(resource_request_overrides(&effects.resource_requests));
    Ok(())
}

/// One `memory={q},cpu={q}` annotation per deployment/container pair
pub fn resource_request_overrides(requests: &[ResourceRequest]) -> BTreeMap<String, String> {
    requests
        .iter()
        .filter_map(|r| {
            let parts: Vec<String> = [("memory", &r.memory), ("cpu", &r.cpu)]
                .into_iter()
                .filter_map(|(k, v)| v.as_ref().map(|q| format!("{k}={q}")))
                .collect();
            if parts.is_empty() {
                return None;
            }
            Some((
                format!(
                    "{RESOURCE_REQUEST_OVERRIDE_PREFIX}/{}.{}",
                    r.deployment_name, r.container_name
                ),
                parts.join(","),
            ))
        })
        .collect()
}

/// Diff between two annotation maps as a merge-patch payload
pub fn annotation_changes(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut changes: BTreeMap<String, Option<String>> = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();
    changes.extend(
        current
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .map(|k| (k.clone(), None)),
    );
    changes
}

fn set_or_clear(annotations: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => {
            annotations.insert(key.to_string(), v);
        }
        None => {
            annotations.remove(key);
        }
    }
}

fn first_label(selected: &[&Node], key: &str) -> Option<String> {
    selected
        .iter()
        .find_map(|n| nodes::label(n, key))
        .map(str::to_string)
}

/// Parses a duration in Go notation, e.g. "1h5m", "90s", "1.5s", "300ms"
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let mut rest = raw.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() || rest.starts_with('-') {
        return None;
    }
    rest = rest.strip_prefix('+').unwrap_or(rest);

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }
    Some(Duration::from_nanos(total_nanos.round() as u64))
}

/// Renders a duration the way Go's `time.Duration.String` does
pub fn format_go_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 1_000_000));
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = fraction(nanos % 60_000_000_000, 1_000_000_000);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// `value / unit` as a decimal with trailing zeros trimmed
fn fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let width = unit.to_string().len() - 1;
    let digits = format!("{rem:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Tracks sizing-configuration validity for one loop so transitions are
/// logged once instead of on every tick
#[derive(Debug, Default)]
pub struct ValidityTracker {
    // 0 = not observed yet, 1 = usable, 2 = missing or invalid
    state: AtomicU8,
}

impl ValidityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation; returns true if it differs from the previous one
    pub fn observe(&self, controller: &str, usable: bool) -> bool {
        let next = if usable { 1 } else { 2 };
        let previous = self.state.swap(next, Ordering::SeqCst);
        if previous == next {
            return false;
        }
        if usable {
            info!(controller, "Cluster sizing configuration is valid, resuming");
        } else {
            info!(
                controller,
                "Cluster sizing configuration is missing or not valid, skipping until it is"
            );
        }
        true
    }

    pub fn is_usable(&self) -> bool {
        self.state.load(Ordering::SeqCst) == 1
    }
}

/// Loads the sizing configuration, returning it only when it is valid
pub async fn usable_configuration(
    api: &dyn ClusterApi,
    tracker: &ValidityTracker,
    controller: &str,
) -> Result<Option<ClusterSizingConfiguration>> {
    let config = api
        .get_sizing_configuration()
        .await?
        .filter(ClusterSizingConfiguration::is_valid);
    tracker.observe(controller, config.is_some());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{dedicated_node, sizing_config};
    use crate::crd::SizeConfiguration;

    fn config_with(name: &str, effects: Effects) -> ClusterSizingConfiguration {
        sizing_config(vec![SizeConfiguration {
            name: name.to_string(),
            effects: Some(effects),
            ..Default::default()
        }])
    }

    fn node_with(labels: &[(&str, &str)]) -> Node {
        let mut node = dedicated_node("n", "large", "z1", "");
        let map = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        map.remove(PAIRED_NODES_LABEL);
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        node
    }

    #[test]
    fn test_unknown_size_class() {
        let config = sizing_config(vec![]);
        let err = scheduling_annotations(&BTreeMap::new(), "small", &config, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not find size configuration for size small"
        );
    }

    #[test]
    fn test_size_without_effects_only_marks_scheduled() {
        let config = sizing_config(vec![SizeConfiguration {
            name: "small".to_string(),
            ..Default::default()
        }]);
        let out = scheduling_annotations(&BTreeMap::new(), "small", &config, &[]).unwrap();
        assert_eq!(
            out,
            BTreeMap::from([(SCHEDULED_ANNOTATION.to_string(), "true".to_string())])
        );
    }

    #[test]
    fn test_node_mem_limit_overrides_effect() {
        let config = config_with(
            "large",
            Effects {
                kas_go_mem_limit: Some("2Ki".to_string()),
                ..Default::default()
            },
        );
        let node = node_with(&[(GO_MEM_LIMIT_LABEL, "4096")]);
        let out = scheduling_annotations(&BTreeMap::new(), "large", &config, &[&node]).unwrap();
        assert_eq!(out[KAS_GO_MEM_LIMIT_ANNOTATION], "4096");
        assert_eq!(
            out[NODE_ADDITIONAL_SELECTOR_ANNOTATION],
            format!("{NODE_SIZE_LABEL}=large")
        );

        let without_nodes = scheduling_annotations(&BTreeMap::new(), "large", &config, &[]).unwrap();
        assert_eq!(without_nodes[KAS_GO_MEM_LIMIT_ANNOTATION], "2Ki");
        assert!(!without_nodes.contains_key(NODE_ADDITIONAL_SELECTOR_ANNOTATION));
    }

    #[test]
    fn test_absent_effects_clear_annotations() {
        let config = config_with("medium", Effects::default());
        let current = BTreeMap::from([
            (MACHINE_HEALTH_CHECK_TIMEOUT_ANNOTATION.to_string(), "30s".to_string()),
            (ETCD_PRIORITY_CLASS_ANNOTATION.to_string(), "old".to_string()),
            (
                format!("{RESOURCE_REQUEST_OVERRIDE_PREFIX}/kas.kas"),
                "cpu=1".to_string(),
            ),
            ("unrelated".to_string(), "kept".to_string()),
        ]);
        let out = scheduling_annotations(&current, "medium", &config, &[]).unwrap();
        assert_eq!(
            out,
            BTreeMap::from([
                (SCHEDULED_ANNOTATION.to_string(), "true".to_string()),
                ("unrelated".to_string(), "kept".to_string()),
            ])
        );
    }

    #[test]
    fn test_effects_and_node_labels() {
        let config = config_with(
            "medium",
            Effects {
                control_plane_priority_class_name: Some("cp".to_string()),
                etcd_priority_class_name: Some("etcd".to_string()),
                api_critical_priority_class_name: Some("api".to_string()),
                maximum_requests_inflight: Some(1000),
                maximum_mutating_requests_inflight: Some(500),
                machine_health_check_timeout: Some("90s".to_string()),
                resource_requests: vec![ResourceRequest {
                    deployment_name: "kas".to_string(),
                    container_name: "kube-apiserver".to_string(),
                    memory: Some("2Ki".to_string()),
                    cpu: Some("500m".to_string()),
                }],
                ..Default::default()
            },
        );
        let first = node_with(&[(LB_SUBNETS_LABEL, "subnet-1.subnet-2")]);
        let second = node_with(&[(LB_SUBNETS_LABEL, "ignored"), (PAIRED_NODES_LABEL, "P")]);
        let out =
            scheduling_annotations(&BTreeMap::new(), "medium", &config, &[&first, &second]).unwrap();

        assert_eq!(out[CONTROL_PLANE_PRIORITY_CLASS_ANNOTATION], "cp");
        assert_eq!(out[ETCD_PRIORITY_CLASS_ANNOTATION], "etcd");
        assert_eq!(out[API_CRITICAL_PRIORITY_CLASS_ANNOTATION], "api");
        assert_eq!(out[MAX_REQUESTS_INFLIGHT_ANNOTATION], "1000");
        assert_eq!(out[MAX_MUTATING_REQUESTS_INFLIGHT_ANNOTATION], "500");
        assert_eq!(out[MACHINE_HEALTH_CHECK_TIMEOUT_ANNOTATION], "1m30s");
        assert_eq!(
            out[&format!("{RESOURCE_REQUEST_OVERRIDE_PREFIX}/kas.kube-apiserver")],
            "memory=2Ki,cpu=500m"
        );
        assert_eq!(out[LB_SUBNETS_ANNOTATION], "subnet-1,subnet-2");
        assert_eq!(
            out[LB_TARGET_NODES_ANNOTATION],
            format!("{PAIRED_NODES_LABEL}=P")
        );
    }

    #[test]
    fn test_projection_is_idempotent() {
        let config = config_with(
            "medium",
            Effects {
                kas_go_mem_limit: Some("1Gi".to_string()),
                machine_health_check_timeout: Some("1h".to_string()),
                ..Default::default()
            },
        );
        let node = node_with(&[(PAIRED_NODES_LABEL, "P")]);
        let once = scheduling_annotations(&BTreeMap::new(), "medium", &config, &[&node]).unwrap();
        let twice = scheduling_annotations(&once, "medium", &config, &[&node]).unwrap();
        assert_eq!(once, twice);
        assert!(annotation_changes(&once, &twice).is_empty());
    }

    #[test]
    fn test_resource_request_overrides_omit_absent_fields() {
        let overrides = resource_request_overrides(&[
            ResourceRequest {
                deployment_name: "kube-controller-manager".to_string(),
                container_name: "kube-controller-manager".to_string(),
                memory: None,
                cpu: Some("500m".to_string()),
            },
            ResourceRequest {
                deployment_name: "etcd".to_string(),
                container_name: "etcd".to_string(),
                memory: Some("1Gi".to_string()),
                cpu: None,
            },
        ]);
        assert_eq!(
            overrides,
            BTreeMap::from([
                (
                    format!("{RESOURCE_REQUEST_OVERRIDE_PREFIX}/kube-controller-manager.kube-controller-manager"),
                    "cpu=500m".to_string()
                ),
                (
                    format!("{RESOURCE_REQUEST_OVERRIDE_PREFIX}/etcd.etcd"),
                    "memory=1Gi".to_string()
                ),
            ])
        );
    }

    #[test]
    fn test_annotation_changes() {
        let current = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let desired = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("c".to_string(), "3".to_string()),
        ]);
        assert_eq!(
            annotation_changes(&current, &desired),
            BTreeMap::from([
                ("b".to_string(), None),
                ("c".to_string(), Some("3".to_string())),
            ])
        );
    }

    #[test]
    fn test_go_durations() {
        let cases = [
            ("30s", "30s"),
            ("90s", "1m30s"),
            ("1h", "1h0m0s"),
            ("1h5m", "1h5m0s"),
            ("1.5s", "1.5s"),
            ("300ms", "300ms"),
            ("0", "0s"),
        ];
        for (input, expected) in cases {
            let parsed = parse_go_duration(input).unwrap_or_else(|| panic!("parse {input}"));
            assert_eq!(format_go_duration(parsed), expected, "input {input}");
        }
        assert!(parse_go_duration("").is_none());
        assert!(parse_go_duration("10").is_none());
        assert!(parse_go_duration("5d").is_none());
        assert!(parse_go_duration("-1s").is_none());
    }

    #[test]
    fn test_validity_tracker_reports_transitions_once() {
        let tracker = ValidityTracker::new();
        assert!(tracker.observe("test", false));
        assert!(!tracker.observe("test", false));
        assert!(tracker.observe("test", true));
        assert!(tracker.is_usable());
        assert!(!tracker.observe("test", true));
    }
}
