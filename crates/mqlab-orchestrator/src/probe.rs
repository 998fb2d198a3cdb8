use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mqlab_cloud::{wait_for, Backoff, CloudClient, WaitError};
use mqlab_domain::{Fleet, HealthProbe, Host, Role, BENCHMARK_BIN};
use mqlab_exec::{ExecError, Executor};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::ExperimentContext;
use crate::error::OrchestratorError;

/// Per-command deadline for a single remote probe invocation.
const PROBE_CMD_DEADLINE: Duration = Duration::from_secs(60);

/// Per-stage deadlines for the readiness cascade.
#[derive(Debug, Clone, Copy)]
pub struct StageBudgets {
    pub fleet: Duration,
    pub agents: Duration,
    pub services: Duration,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            fleet: Duration::from_secs(300),
            // Fresh hosts take the longest to register an agent.
            agents: Duration::from_secs(600),
            services: Duration::from_secs(600),
        }
    }
}

/// The three-stage readiness cascade: fleet reachable → agents online →
/// services active and endpoints healthy. Stages run strictly in order;
/// probes within a stage fan out across hosts and barrier at stage end.
pub struct Prober {
    cloud: Arc<CloudClient>,
    executor: Arc<Executor>,
    budgets: StageBudgets,
}

impl Prober {
    pub fn new(cloud: Arc<CloudClient>, executor: Arc<Executor>) -> Self {
        Self {
            cloud,
            executor,
            budgets: StageBudgets::default(),
        }
    }

    pub fn with_budgets(mut self, budgets: StageBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Drive the full cascade. Success means every host passed every probe
    /// of its role at least once.
    pub async fn converge(
        &self,
        ctx: &ExperimentContext,
        fleet: &Fleet,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        self.stage_fleet_reachable(ctx, fleet, cancel).await?;
        self.stage_agents_online(ctx, fleet, cancel).await?;
        self.stage_services_healthy(ctx, fleet, cancel).await?;
        ctx.note("readiness: fleet converged");
        Ok(())
    }

    // ── Stage 1: fleet reachable ──────────────────────────────────────────────

    async fn stage_fleet_reachable(
        &self,
        ctx: &ExperimentContext,
        fleet: &Fleet,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        ctx.note("readiness stage 1: waiting for fleet to reach running state");
        let wanted: BTreeSet<&str> = fleet.instance_ids().into_iter().collect();

        let outcome = wait_for(
            "fleet reachable",
            Backoff::probe(),
            self.budgets.fleet,
            cancel,
            || {
                let cloud = &self.cloud;
                let wanted = &wanted;
                let id = &ctx.id;
                async move {
                    // The tag index is eventually consistent; a missing host
                    // is "not yet", not an error.
                    let infos = cloud.describe_instances_by_tag(id).await?;
                    let running: BTreeSet<&str> = infos
                        .iter()
                        .filter(|i| i.state == "running")
                        .map(|i| i.id.as_str())
                        .collect();
                    let missing: Vec<&&str> = wanted.difference(&running).collect();
                    if missing.is_empty() {
                        Ok(Some(()))
                    } else {
                        info!(missing = ?missing, "stage 1: hosts not yet running");
                        Ok(None)
                    }
                }
            },
        )
        .await;

        self.finish_stage(ctx, "fleet", outcome.map(|_| ()), || {
            format!("{} host(s) never reached running", wanted.len())
        })
    }

    // ── Stage 2: agents online ────────────────────────────────────────────────

    async fn stage_agents_online(
        &self,
        ctx: &ExperimentContext,
        fleet: &Fleet,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        ctx.note("readiness stage 2: waiting for control-plane agents");
        let wanted: BTreeSet<&str> = fleet.instance_ids().into_iter().collect();

        let outcome = wait_for(
            "agents online",
            Backoff::probe(),
            self.budgets.agents,
            cancel,
            || {
                let cloud = &self.cloud;
                let wanted = &wanted;
                let id = &ctx.id;
                async move {
                    let online = cloud.online_agents(id).await?;
                    let online: BTreeSet<&str> = online.iter().map(String::as_str).collect();
                    let missing: Vec<&&str> = wanted.difference(&online).collect();
                    if missing.is_empty() {
                        Ok(Some(()))
                    } else {
                        info!(missing = ?missing, "stage 2: agents not yet registered");
                        Ok(None)
                    }
                }
            },
        )
        .await;

        self.finish_stage(ctx, "agents", outcome.map(|_| ()), || {
            "agent registration incomplete".to_string()
        })
    }

    // ── Stage 3: services active, endpoints healthy ───────────────────────────

    async fn stage_services_healthy(
        &self,
        ctx: &ExperimentContext,
        fleet: &Fleet,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        ctx.note("readiness stage 3: probing services and endpoints");
        let stage_end = Instant::now() + self.budgets.services;

        let mut tasks: JoinSet<Result<(), (String, String)>> = JoinSet::new();
        for host in fleet.hosts.clone() {
            let executor = self.executor.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                probe_host(&executor, &host, stage_end, &cancel).await
            });
        }

        let mut first_failure: Option<(String, String)> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err((host, component))) => {
                    warn!(host, component, "stage 3: probe failed");
                    ctx.log.append(&format!(
                        "readiness stage 3 failure: host {} component {}",
                        host, component
                    ));
                    first_failure.get_or_insert((host, component));
                }
                Err(e) => {
                    return Err(OrchestratorError::Internal(format!("probe task: {}", e)))
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        match first_failure {
            None => {
                ctx.note("readiness stage 3: all services healthy");
                Ok(())
            }
            Some((host, component)) => Err(OrchestratorError::ReadinessTimeout {
                stage: "services",
                detail: format!("host {} component {}", host, component),
            }),
        }
    }

    fn finish_stage(
        &self,
        ctx: &ExperimentContext,
        stage: &'static str,
        outcome: Result<(), WaitError>,
        detail: impl FnOnce() -> String,
    ) -> Result<(), OrchestratorError> {
        match outcome {
            Ok(()) => {
                ctx.note(&format!("readiness stage '{}' passed", stage));
                Ok(())
            }
            Err(WaitError::Cancelled { .. }) => Err(OrchestratorError::Cancelled),
            Err(WaitError::TimedOut { .. }) => {
                ctx.log.append(&format!("readiness stage '{}' timed out", stage));
                Err(OrchestratorError::ReadinessTimeout { stage, detail: detail() })
            }
            Err(WaitError::Aborted { source, .. }) => Err(source.into()),
        }
    }
}

/// Probe one host: every service of its role must report active, then every
/// health endpoint must answer correctly at least once. Failures name the
/// component for the operator.
async fn probe_host(
    executor: &Executor,
    host: &Host,
    stage_end: Instant,
    cancel: &CancellationToken,
) -> Result<(), (String, String)> {
    if host.role == Role::Worker {
        // Workers run no services; fitness is the benchmark binary on disk.
        let command = format!("test -x {}", BENCHMARK_BIN);
        return probe_until_pass(
            executor, host, "benchmark binary", &command, ProbeCheck::ExitOnly,
            stage_end, cancel,
        )
        .await;
    }

    for descriptor in host.role.service_descriptors() {
        if descriptor.required_active {
            let command = format!("systemctl is-active {}", descriptor.unit);
            probe_until_pass(
                executor,
                host,
                descriptor.unit,
                &command,
                ProbeCheck::StdoutEquals("active".to_string()),
                stage_end,
                cancel,
            )
            .await?;
        }
        for probe in descriptor.probes {
            let (command, check) = materialise_probe(probe);
            let component = format!("{} {}", descriptor.unit, probe_label(probe));
            probe_until_pass(executor, host, &component, &command, check, stage_end, cancel)
                .await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum ProbeCheck {
    /// Exit 0 is enough.
    ExitOnly,
    /// Trimmed stdout must equal this.
    StdoutEquals(String),
    /// Stdout must contain this.
    StdoutContains(String),
}

/// Render a health probe as the shell command run on the host itself.
fn materialise_probe(probe: &HealthProbe) -> (String, ProbeCheck) {
    match probe {
        HealthProbe::TcpPort { port } => (
            format!("timeout 5 bash -c 'exec 3<>/dev/tcp/127.0.0.1/{}'", port),
            ProbeCheck::ExitOnly,
        ),
        HealthProbe::TextChallenge { port, send, expect } => (
            format!("printf '{}' | timeout 5 nc 127.0.0.1 {}", send, port),
            ProbeCheck::StdoutContains(expect.to_string()),
        ),
        HealthProbe::HttpStatus { url, expect } => (
            format!("curl -s -o /dev/null --max-time 5 -w '%{{http_code}}' {}", url),
            ProbeCheck::StdoutEquals(expect.to_string()),
        ),
    }
}

fn probe_label(probe: &HealthProbe) -> &'static str {
    match probe {
        HealthProbe::TcpPort { .. } => "tcp",
        HealthProbe::TextChallenge { .. } => "challenge",
        HealthProbe::HttpStatus { .. } => "http",
    }
}

/// Run one probe repeatedly until it passes once. A probe that fails on the
/// remote side is "not yet"; only infrastructure errors abort early. Failed
/// probes never latch success.
async fn probe_until_pass(
    executor: &Executor,
    host: &Host,
    component: &str,
    command: &str,
    check: ProbeCheck,
    stage_end: Instant,
    cancel: &CancellationToken,
) -> Result<(), (String, String)> {
    let fail = || (host.id.clone(), component.to_string());
    let remaining = stage_end.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(fail());
    }

    let label = format!("{} on {}", component, host.id);
    let payload = vec![command.to_string()];
    let outcome = wait_for(&label, Backoff::probe(), remaining, cancel, || {
        let payload = payload.clone();
        let check = check.clone();
        async move {
            match executor.run(&host.id, &payload, PROBE_CMD_DEADLINE, cancel).await {
                Ok(result) => {
                    let passed = match &check {
                        ProbeCheck::ExitOnly => result.exit_code == 0,
                        ProbeCheck::StdoutEquals(want) => result.stdout.trim() == want.as_str(),
                        ProbeCheck::StdoutContains(want) => result.stdout.contains(want),
                    };
                    Ok(passed.then_some(()))
                }
                // The probe ran and said "not healthy"; poll again.
                Err(ExecError::ExecutionFailed { .. }) => Ok(None),
                Err(ExecError::DeadlineExceeded { .. }) => Ok(None),
                Err(ExecError::Cancelled { .. }) => Err(mqlab_cloud::CloudError::Internal(
                    "cancelled".into(),
                )),
                Err(ExecError::Cloud(e)) => Err(e),
                Err(other) => Err(mqlab_cloud::CloudError::Internal(other.to_string())),
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            info!(host = %host.id, component, "probe passed");
            Ok(())
        }
        Err(_) => Err(fail()),
    }
}
