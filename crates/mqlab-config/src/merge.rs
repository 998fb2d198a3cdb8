use std::collections::BTreeMap;

use mqlab_domain::Workload;
use serde_json::Value;

use crate::error::ConfigError;

/// Overlay variant overrides onto a base workload.
///
/// A pure function of `(base, overrides)`:
/// - every field of the base (all of which carry defaults) is present after
///   the merge;
/// - override values win over base values;
/// - keys that name no workload field are rejected;
/// - a message-size distribution is normalised to unit weight sum.
pub fn merge_workload(
    base: &Workload,
    overrides: &BTreeMap<String, Value>,
) -> Result<Workload, ConfigError> {
    let mut doc = serde_json::to_value(base).map_err(|e| ConfigError::Merge(e.to_string()))?;
    let map = doc
        .as_object_mut()
        .ok_or_else(|| ConfigError::Merge("workload did not serialise to a mapping".into()))?;

    for (key, value) in overrides {
        if !map.contains_key(key) {
            return Err(ConfigError::UnknownWorkloadKey(key.clone()));
        }
        map.insert(key.clone(), value.clone());
    }

    let mut merged: Workload = serde_json::from_value(doc)
        .map_err(|e| ConfigError::Merge(format!("override has wrong type: {}", e)))?;
    merged.message_size.normalise()?;
    Ok(merged)
}

/// Serialise a merged workload to its on-disk artefact form.
/// Stable: field order is fixed by the struct, distribution buckets sort.
pub fn render_artefact(workload: &Workload) -> Result<String, ConfigError> {
    serde_yaml::to_string(workload).map_err(|e| ConfigError::Merge(e.to_string()))
}
