use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw YAML representation of an infrastructure config file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawInfra {
    pub cluster_name: String,
    pub project: String,
    pub region: String,
    /// Provisioner module directory, relative to the config file.
    pub module_dir: String,
    /// Provisioner binary override. Absent = `terraform` from PATH.
    pub provisioner: Option<String>,
    pub roles: RawRoles,
    pub storage: RawStorage,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawRoles {
    pub coordinator: RawRoleSpec,
    pub storage: RawRoleSpec,
    pub broker: RawRoleSpec,
    pub worker: RawRoleSpec,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawRoleSpec {
    pub count: u32,
    pub instance_type: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawStorage {
    pub volume_gb: u32,
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
}

fn default_volume_type() -> String {
    "gp3".to_string()
}

/// Raw YAML representation of a test plan file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawTestPlan {
    pub name: String,
    /// Base workload as a free-form mapping; merged over workload defaults
    /// so unknown keys are rejected the same way variant overrides are.
    #[serde(default)]
    pub workload: BTreeMap<String, serde_json::Value>,
    pub variants: Vec<RawVariant>,
    pub plateau: Option<RawPlateau>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawVariant {
    pub name: String,
    pub kind: String,
    pub target_rate: Option<f64>,
    #[serde(default)]
    pub overrides: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawPlateau {
    pub allowed_deviation_pct: f64,
    pub consecutive_fails_allowed: u32,
}
