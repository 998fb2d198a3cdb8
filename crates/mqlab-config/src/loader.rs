use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mqlab_domain::{PlateauPolicy, Role, TestMatrix, TestVariant, VariantKind, Workload};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::merge::merge_workload;
use crate::raw::{RawInfra, RawRoleSpec, RawTestPlan};

// ── Infrastructure config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub count: u32,
    pub instance_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolesSpec {
    pub coordinator: RoleSpec,
    pub storage: RoleSpec,
    pub broker: RoleSpec,
    pub worker: RoleSpec,
}

impl RolesSpec {
    pub fn get(&self, role: Role) -> &RoleSpec {
        match role {
            Role::Coordinator => &self.coordinator,
            Role::Storage => &self.storage,
            Role::Broker => &self.broker,
            Role::Worker => &self.worker,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub volume_gb: u32,
    pub volume_type: String,
}

/// The validated infrastructure shape handed to the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraConfig {
    pub cluster_name: String,
    pub project: String,
    pub region: String,
    /// Absolute path to the provisioner module directory.
    pub module_dir: PathBuf,
    /// Provisioner binary override. None = `terraform` from PATH.
    pub provisioner: Option<String>,
    pub roles: RolesSpec,
    pub storage: StorageSpec,
    pub tags: BTreeMap<String, String>,
}

/// Load and validate an infrastructure config file.
pub fn load_infra(path: &Path) -> Result<InfraConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawInfra = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!("loaded infra config from {}", path.display());
    convert_infra(raw, path)
}

fn convert_infra(raw: RawInfra, path: &Path) -> Result<InfraConfig, ConfigError> {
    for (role, spec) in [
        (Role::Coordinator, &raw.roles.coordinator),
        (Role::Storage, &raw.roles.storage),
        (Role::Broker, &raw.roles.broker),
        (Role::Worker, &raw.roles.worker),
    ] {
        check_role_spec(role, spec, path)?;
    }
    if raw.storage.volume_gb == 0 {
        return Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: "storage.volume_gb must be at least 1".into(),
        });
    }

    // module_dir resolves relative to the config file's directory.
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let module_dir = base.join(&raw.module_dir);

    Ok(InfraConfig {
        cluster_name: raw.cluster_name,
        project: raw.project,
        region: raw.region,
        module_dir,
        provisioner: raw.provisioner,
        roles: RolesSpec {
            coordinator: convert_role_spec(&raw.roles.coordinator),
            storage: convert_role_spec(&raw.roles.storage),
            broker: convert_role_spec(&raw.roles.broker),
            worker: convert_role_spec(&raw.roles.worker),
        },
        storage: StorageSpec {
            volume_gb: raw.storage.volume_gb,
            volume_type: raw.storage.volume_type,
        },
        tags: raw.tags,
    })
}

fn check_role_spec(role: Role, spec: &RawRoleSpec, path: &Path) -> Result<(), ConfigError> {
    if spec.count == 0 {
        return Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("role {} must have count >= 1", role),
        });
    }
    if spec.instance_type.is_empty() {
        return Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("role {} is missing an instance_type", role),
        });
    }
    Ok(())
}

fn convert_role_spec(raw: &RawRoleSpec) -> RoleSpec {
    RoleSpec {
        count: raw.count,
        instance_type: raw.instance_type.clone(),
    }
}

// ── Test plan ─────────────────────────────────────────────────────────────────

/// Load a test plan file into a validated matrix. The base workload is the
/// plan's `workload:` mapping merged over workload defaults, so a plan only
/// states what differs and malformed keys are caught here, not mid-run.
pub fn load_test_plan(path: &Path) -> Result<TestMatrix, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let raw: RawTestPlan = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })?;
    debug!(
        variants = raw.variants.len(),
        "loaded test plan from {}",
        path.display()
    );

    let base = merge_workload(&Workload::default(), &raw.workload)?;

    let variants = raw
        .variants
        .into_iter()
        .map(|v| {
            Ok(TestVariant {
                name: v.name,
                kind: VariantKind::parse(&v.kind)?,
                target_rate: v.target_rate,
                overrides: v.overrides,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let matrix = TestMatrix {
        name: raw.name,
        base,
        variants,
        plateau: raw.plateau.map(|p| PlateauPolicy {
            allowed_deviation_pct: p.allowed_deviation_pct,
            consecutive_fails_allowed: p.consecutive_fails_allowed,
        }),
    };
    matrix.validate()?;

    // Every variant's overrides must merge cleanly against the base; doing
    // it here keeps mid-matrix failures to genuinely remote causes.
    for v in &matrix.variants {
        merge_workload(&matrix.base, &v.overrides)?;
    }

    Ok(matrix)
}
