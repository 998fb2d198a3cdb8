use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Identity of one end-to-end experiment run: `exp-<UTC timestamp>`.
/// Minted once at Init and immutable thereafter; every cloud resource the
/// experiment creates carries this value in its `ExperimentID` tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    /// Mint an id from a creation instant, e.g. `exp-20260801-142530`.
    pub fn mint(at: DateTime<Utc>) -> Self {
        ExperimentId(at.format("exp-%Y%m%d-%H%M%S").to_string())
    }

    /// Parse and validate an operator-supplied id.
    pub fn parse(s: impl Into<String>) -> Result<Self, DomainError> {
        let s = s.into();
        let rest = s
            .strip_prefix("exp-")
            .ok_or_else(|| DomainError::InvalidExperimentId(s.clone()))?;
        let ok = rest.len() == 15
            && rest
                .bytes()
                .enumerate()
                .all(|(i, b)| if i == 8 { b == b'-' } else { b.is_ascii_digit() });
        if !ok {
            return Err(DomainError::InvalidExperimentId(s));
        }
        Ok(ExperimentId(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Phase ─────────────────────────────────────────────────────────────────────

/// The experiment lifecycle state machine.
///
/// Transitions:
///   Init → Provision → Converge → RunMatrix → Report → Teardown
///   any non-terminal → Teardown (rollback, carrying the causal error)
///   Teardown → Failed (reclaim did not come back clean)
///
/// `Failed` is a sink. Only the sequencer transitions phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Provision,
    Converge,
    RunMatrix,
    Report,
    Teardown,
    Failed,
}

impl Phase {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Init, Provision) => true,
            (Provision, Converge) => true,
            (Converge, RunMatrix) => true,
            (RunMatrix, Report) => true,
            (Report, Teardown) => true,
            // Rollback: any non-terminal phase may enter Teardown early.
            (Init | Provision | Converge | RunMatrix, Teardown) => true,
            (Teardown, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Init => "init",
            Phase::Provision => "provision",
            Phase::Converge => "converge",
            Phase::RunMatrix => "run_matrix",
            Phase::Report => "report",
            Phase::Teardown => "teardown",
            Phase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ── Roles and fleet ───────────────────────────────────────────────────────────

/// Cluster role of a host. Fixed at provisioning, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Storage,
    Broker,
    Worker,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Coordinator, Role::Storage, Role::Broker, Role::Worker];

    pub fn parse(s: &str) -> Result<Role, DomainError> {
        match s {
            "coordinator" => Ok(Role::Coordinator),
            "storage" => Ok(Role::Storage),
            "broker" => Ok(Role::Broker),
            "worker" => Ok(Role::Worker),
            other => Err(DomainError::InvalidRole(other.to_string())),
        }
    }

    /// The services and health endpoints this role must expose before the
    /// fleet counts as converged.
    pub fn service_descriptors(self) -> &'static [ServiceDescriptor] {
        match self {
            Role::Coordinator => &[ServiceDescriptor {
                unit: "zk.service",
                required_active: true,
                probes: &[
                    HealthProbe::TcpPort { port: 2181 },
                    HealthProbe::TextChallenge {
                        port: 2181,
                        send: "ruok",
                        expect: "imok",
                    },
                ],
            }],
            Role::Storage => &[ServiceDescriptor {
                unit: "bk.service",
                required_active: true,
                probes: &[HealthProbe::TcpPort { port: 3181 }],
            }],
            Role::Broker => &[ServiceDescriptor {
                unit: "broker.service",
                required_active: true,
                probes: &[HealthProbe::HttpStatus {
                    url: "http://127.0.0.1:8080/admin/v2/brokers/health",
                    expect: 200,
                }],
            }],
            // Workers run no services; fitness is the benchmark binary on disk.
            Role::Worker => &[],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Coordinator => "coordinator",
            Role::Storage => "storage",
            Role::Broker => "broker",
            Role::Worker => "worker",
        };
        write!(f, "{}", s)
    }
}

/// Path every worker must carry for the fleet to pass readiness.
pub const BENCHMARK_BIN: &str = "/opt/mqlab/benchmark/bin/benchmark";

/// One service a role is expected to run, plus how to prove it healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// systemd unit name.
    pub unit: &'static str,
    /// Whether `systemctl is-active` must report active.
    pub required_active: bool,
    /// Health probes executed from the host itself, never externally.
    pub probes: &'static [HealthProbe],
}

/// A single health probe, run on the host via the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthProbe {
    /// Open-close against a local port; success = connection accepted.
    TcpPort { port: u16 },
    /// Send literal text, match the expected response.
    TextChallenge {
        port: u16,
        send: &'static str,
        expect: &'static str,
    },
    /// GET the URL, expect the exact status.
    HttpStatus { url: &'static str, expect: u16 },
}

/// One provisioned cloud host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Opaque cloud instance identifier.
    pub id: String,
    /// Private IP inside the cluster network.
    pub private_ip: String,
    pub role: Role,
}

/// The provisioned cluster: hosts grouped by role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fleet {
    pub hosts: Vec<Host>,
}

impl Fleet {
    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(move |h| h.role == role)
    }

    pub fn workers(&self) -> Vec<&Host> {
        self.by_role(Role::Worker).collect()
    }

    pub fn instance_ids(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// ── Tags ──────────────────────────────────────────────────────────────────────

pub const TAG_PROJECT: &str = "Project";
pub const TAG_EXPERIMENT_ID: &str = "ExperimentID";
pub const TAG_COMPONENT: &str = "Component";
pub const TAG_MANAGED_BY: &str = "ManagedBy";

/// Cloud tag set. BTreeMap so rendered documents are stable.
pub type TagMap = BTreeMap<String, String>;

/// The tags every created resource must carry. `extra` entries (config tags
/// overlaid with CLI `--tag` pairs, CLI winning) merge over the required
/// four but cannot displace them.
pub fn required_tags(project: &str, experiment: &ExperimentId, extra: &TagMap) -> TagMap {
    let mut tags = extra.clone();
    tags.insert(TAG_PROJECT.into(), project.to_string());
    tags.insert(TAG_EXPERIMENT_ID.into(), experiment.to_string());
    tags.insert(TAG_MANAGED_BY.into(), "mqlab".into());
    tags
}

// ── Remote commands ───────────────────────────────────────────────────────────

/// Terminal and in-flight states of a control-plane command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

impl CommandStatus {
    pub fn parse(s: &str) -> Result<CommandStatus, DomainError> {
        match s {
            "Pending" => Ok(CommandStatus::Pending),
            "InProgress" => Ok(CommandStatus::InProgress),
            "Success" => Ok(CommandStatus::Success),
            "Failed" => Ok(CommandStatus::Failed),
            "Cancelled" => Ok(CommandStatus::Cancelled),
            "TimedOut" => Ok(CommandStatus::TimedOut),
            other => Err(DomainError::InvalidCommandStatus(other.to_string())),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::InProgress)
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Pending => "Pending",
            CommandStatus::InProgress => "InProgress",
            CommandStatus::Success => "Success",
            CommandStatus::Failed => "Failed",
            CommandStatus::Cancelled => "Cancelled",
            CommandStatus::TimedOut => "TimedOut",
        };
        write!(f, "{}", s)
    }
}

/// What a finished remote command left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ── Health snapshots ──────────────────────────────────────────────────────────

/// One infrastructure health sample for one host. The sampler appends these
/// at a fixed cadence for the duration of a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub at: DateTime<Utc>,
    pub host: String,
    pub role: Role,
    pub heap_used_kb: u64,
    pub gc_young: u64,
    pub gc_old: u64,
    pub cpu_load_1m: f64,
    pub mem_available_mb: u64,
}
