//! Pair-coordination records
//!
//! A record is a ConfigMap in the placeholder namespace whose name is a pair
//! label and whose data names the tenant that owns the pair. Creating a
//! record is the only linearization point for pair ownership: the store
//! rejects a second create with the same name, so at most one tenant can
//! hold a given pair.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::client::ClusterApi;
use super::labels::{CLUSTER_NAMESPACE_KEY, CLUSTER_NAME_KEY, PAIR_LABEL_KEY};

/// Tenant coordinates carried by a record
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordOwner {
    pub namespace: String,
    pub name: String,
}

impl RecordOwner {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RecordOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Builds the record claiming `pair_label` for `owner`
pub fn build_record(namespace: &str, pair_label: &str, owner: &RecordOwner) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(pair_label.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                PAIR_LABEL_KEY.to_string(),
                pair_label.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (CLUSTER_NAMESPACE_KEY.to_string(), owner.namespace.clone()),
            (CLUSTER_NAME_KEY.to_string(), owner.name.clone()),
        ])),
        ..Default::default()
    }
}

/// Reads the owning tenant out of a record
pub fn record_owner(record: &ConfigMap) -> RecordOwner {
    let data = record.data.as_ref();
    let field = |key: &str| {
        data.and_then(|d| d.get(key))
            .cloned()
            .unwrap_or_default()
    };
    RecordOwner {
        namespace: field(CLUSTER_NAMESPACE_KEY),
        name: field(CLUSTER_NAME_KEY),
    }
}

/// Pair label a record claims; falls back to the record name
pub fn record_pair_label(record: &ConfigMap) -> String {
    record
        .labels()
        .get(PAIR_LABEL_KEY)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| record.name_any())
}

/// Pair labels claimed through records
pub fn recorded_pair_labels(records: &[ConfigMap]) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(|r| r.labels().get(PAIR_LABEL_KEY))
        .filter(|v| !v.is_empty())
        .cloned()
        .collect()
}

/// Ensures a record claims `pair_label` for `owner`.
///
/// Fails with [`Error::PairConflict`] when the pair already belongs to a
/// different tenant; the caller must pick another pair.
pub async fn ensure_record(
    api: &dyn ClusterApi,
    pair_label: &str,
    owner: &RecordOwner,
) -> Result<()> {
    let existing = match api.get_record(pair_label).await? {
        Some(record) => record,
        None => {
            let record = build_record(api.placeholder_namespace(), pair_label, owner);
            match api.create_record(&record).await {
                Ok(()) => {
                    info!(pair_label, tenant = %owner, "Created coordination record");
                    return Ok(());
                }
                // Lost the create race: whoever won decides the outcome
                Err(Error::AlreadyExists { .. }) => {
                    api.get_record(pair_label)
                        .await?
                        .ok_or_else(|| Error::StaleWrite {
                            kind: "ConfigMap",
                            name: pair_label.to_string(),
                        })?
                }
                Err(e) => return Err(e),
            }
        }
    };

    let current = record_owner(&existing);
    if &current == owner {
        debug!(pair_label, tenant = %owner, "Coordination record already present");
        Ok(())
    } else {
        Err(Error::PairConflict {
            pair_label: pair_label.to_string(),
            owner: current.to_string(),
        })
    }
}

/// Deletes every record owned by `owner`, returning how many were removed
pub async fn delete_records_for(api: &dyn ClusterApi, owner: &RecordOwner) -> Result<usize> {
    let mut deleted = 0;
    for record in api.list_records().await? {
        if &record_owner(&record) == owner {
            api.delete_record(&record.name_any()).await?;
            info!(record = %record.name_any(), tenant = %owner, "Deleted coordination record");
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Returns the pair label recorded for `owner`, if any.
///
/// When a tenant somehow owns several records the lexically smallest wins so
/// the answer is stable across ticks.
pub async fn lookup_pair_for(api: &dyn ClusterApi, owner: &RecordOwner) -> Result<Option<String>> {
    Ok(pairs_owned_by(&api.list_records().await?, owner)
        .into_iter()
        .next())
}

/// All pair labels recorded for `owner`, sorted
pub fn pairs_owned_by(records: &[ConfigMap], owner: &RecordOwner) -> Vec<String> {
    let mut pairs: Vec<String> = records
        .iter()
        .filter(|r| &record_owner(r) == owner)
        .map(record_pair_label)
        .collect();
    pairs.sort();
    pairs
}
