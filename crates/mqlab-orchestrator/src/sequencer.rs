use std::sync::Arc;

use chrono::Utc;
use mqlab_cloud::{CloudClient, Provisioner};
use mqlab_config::InfraConfig;
use mqlab_domain::{required_tags, ExperimentId, Fleet, Phase, TagMap, TestMatrix};
use mqlab_exec::Executor;
use mqlab_reclaim::Reclaimer;
use mqlab_store::ExperimentStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::ExperimentContext;
use crate::error::OrchestratorError;
use crate::matrix::MatrixRunner;
use crate::probe::Prober;
use crate::report::{self, ReportDoc};

/// Drives the experiment state machine. The sequencer is the only writer of
/// the phase field and the only component that transitions it; everything
/// else receives an immutable [`ExperimentContext`].
pub struct Sequencer {
    cloud: Arc<CloudClient>,
    store: ExperimentStore,
    cancel: CancellationToken,
    phase: Phase,
}

impl Sequencer {
    pub fn new(cloud: Arc<CloudClient>, store: ExperimentStore, cancel: CancellationToken) -> Self {
        Self {
            cloud,
            store,
            cancel,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// The complete lifecycle: nothing → cluster → matrix → report → nothing.
    ///
    /// Guarantees on return: every code path that created cloud resources
    /// has run the reclaimer; any failure transitioned through Teardown to
    /// Failed, was logged, and is re-raised here after cleanup.
    pub async fn run_full(
        &mut self,
        infra: &InfraConfig,
        matrix: &TestMatrix,
        cli_tags: &TagMap,
        id_override: Option<ExperimentId>,
    ) -> Result<ExperimentId, OrchestratorError> {
        let ctx = self.init(infra, cli_tags, id_override)?;
        let provisioner = self.provisioner(&ctx, infra);

        let mut guard = CleanupGuard::new(ctx.id.clone());
        let outcome = self.drive_full(&ctx, matrix, &provisioner).await;
        let result = self.finish(&ctx, &provisioner, outcome).await;
        guard.disarm();
        result.map(|()| ctx.id.clone())
    }

    /// Init + Provision + Converge; leaves the cluster running on success.
    /// On failure the cluster is reclaimed exactly as in a full run.
    pub async fn setup(
        &mut self,
        infra: &InfraConfig,
        cli_tags: &TagMap,
        id_override: Option<ExperimentId>,
    ) -> Result<ExperimentId, OrchestratorError> {
        let ctx = self.init(infra, cli_tags, id_override)?;
        let provisioner = self.provisioner(&ctx, infra);

        let mut guard = CleanupGuard::new(ctx.id.clone());
        let executor = self.executor(&ctx);
        match self.provision_and_converge(&ctx, &provisioner, &executor).await {
            Ok(_fleet) => {
                guard.disarm();
                ctx.note("setup complete; cluster left running");
                Ok(ctx.id.clone())
            }
            Err(causal) => {
                let result = self.finish(&ctx, &provisioner, Err(causal)).await;
                guard.disarm();
                result.map(|()| ctx.id.clone())
            }
        }
    }

    /// RunMatrix + Report against an existing cluster. The cluster is left
    /// running; teardown stays an explicit operator action.
    pub async fn run_matrix(
        &mut self,
        matrix: &TestMatrix,
        id: &ExperimentId,
    ) -> Result<ReportDoc, OrchestratorError> {
        let ctx = self.open_context(id)?;
        let fleet = self.read_fleet(&ctx)?;

        // Joining a cluster that already converged.
        self.phase = Phase::Converge;
        self.transition(&ctx, Phase::RunMatrix)?;

        let runner = MatrixRunner::new(self.executor(&ctx));
        runner.run(&ctx, matrix, &fleet, &self.cancel).await?;

        self.transition(&ctx, Phase::Report)?;
        let doc = report::rebuild(&ctx.dir)?;
        ctx.log.append(&report::render_table(&doc));
        Ok(doc)
    }

    /// Rebuild the report from stored artefacts alone.
    pub fn report(&self, id: &ExperimentId) -> Result<ReportDoc, OrchestratorError> {
        let dir = self.store.open(id)?;
        report::rebuild(&dir)
    }

    /// Reclaim only. Works from the tag index alone, so it covers the
    /// crash path where no provisioner state survives.
    pub async fn teardown(&mut self, id: &ExperimentId) -> Result<(), OrchestratorError> {
        if let Ok(ctx) = self.open_context(id) {
            let _ = self.transition(&ctx, Phase::Teardown);
        } else {
            // Crash path: the experiment directory may be gone entirely.
            self.phase = Phase::Teardown;
        }

        let report = Reclaimer::new(self.cloud.clone()).reclaim(id, None).await?;
        if report.is_clean() {
            info!(experiment = %id, destroyed = report.destroyed, "teardown complete");
            Ok(())
        } else {
            self.phase = Phase::Failed;
            Err(OrchestratorError::ReclaimIncomplete(report.errors.join("; ")))
        }
    }

    /// Enumerate stored experiments.
    pub fn list(&self) -> Result<Vec<mqlab_store::ExperimentSummary>, OrchestratorError> {
        Ok(self.store.list()?)
    }

    // ── Phase walk ────────────────────────────────────────────────────────────

    fn transition(&mut self, ctx: &ExperimentContext, to: Phase) -> Result<(), OrchestratorError> {
        if !self.phase.can_transition(to) {
            return Err(OrchestratorError::Internal(format!(
                "illegal phase transition {} -> {}",
                self.phase, to
            )));
        }
        ctx.note(&format!("phase {} -> {}", self.phase, to));
        self.phase = to;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ── Lifecycle pieces ──────────────────────────────────────────────────────

    fn provisioner(&self, ctx: &ExperimentContext, infra: &InfraConfig) -> Provisioner {
        let mut provisioner =
            Provisioner::new(infra.module_dir.clone(), Some(ctx.dir.log_path()));
        if let Some(binary) = &infra.provisioner {
            provisioner.binary = binary.clone();
        }
        provisioner
    }

    /// Init phase: mint the identity, create the store directory, point
    /// `latest` at it, and generate the provisioner inputs. No cloud work.
    fn init(
        &mut self,
        infra: &InfraConfig,
        cli_tags: &TagMap,
        id_override: Option<ExperimentId>,
    ) -> Result<ExperimentContext, OrchestratorError> {
        let id = id_override.unwrap_or_else(|| ExperimentId::mint(Utc::now()));
        let dir = self.store.create(&id)?;
        let log = Arc::new(dir.log()?);

        // Config tags first, CLI tags over them; required keys win overall.
        let mut extra: TagMap = infra.tags.clone();
        extra.extend(cli_tags.clone());
        let tags = required_tags(&infra.project, &id, &extra);

        let ctx = ExperimentContext {
            id,
            dir,
            region: infra.region.clone(),
            tags,
            log,
        };
        ctx.note(&format!(
            "orchestrator run {} for experiment {}",
            Uuid::new_v4(),
            ctx.id
        ));
        self.write_infra_vars(&ctx, infra)?;
        Ok(ctx)
    }

    /// One executor per run; it owns the manifest sequence for the whole
    /// experiment.
    fn executor(&self, ctx: &ExperimentContext) -> Arc<Executor> {
        Arc::new(Executor::new(self.cloud.clone()).with_manifest_dir(ctx.dir.manifests_dir()))
    }

    async fn provision_and_converge(
        &mut self,
        ctx: &ExperimentContext,
        provisioner: &Provisioner,
        executor: &Arc<Executor>,
    ) -> Result<Fleet, OrchestratorError> {
        self.check_cancelled()?;
        self.transition(ctx, Phase::Provision)?;
        provisioner.apply(&ctx.dir.infra_vars_path()).await?;
        let fleet = provisioner.fleet().await?;
        self.write_fleet(ctx, &fleet)?;
        ctx.note(&format!("provisioned fleet of {} hosts", fleet.hosts.len()));

        self.check_cancelled()?;
        self.transition(ctx, Phase::Converge)?;
        Prober::new(self.cloud.clone(), executor.clone())
            .converge(ctx, &fleet, &self.cancel)
            .await?;
        Ok(fleet)
    }

    async fn drive_full(
        &mut self,
        ctx: &ExperimentContext,
        matrix: &TestMatrix,
        provisioner: &Provisioner,
    ) -> Result<(), OrchestratorError> {
        let executor = self.executor(ctx);
        let fleet = self.provision_and_converge(ctx, provisioner, &executor).await?;

        self.check_cancelled()?;
        self.transition(ctx, Phase::RunMatrix)?;
        let runner = MatrixRunner::new(executor);
        // Matrix completion is independent of per-variant success; only
        // cancellation or infrastructure failure propagates from here.
        runner.run(ctx, matrix, &fleet, &self.cancel).await?;

        self.transition(ctx, Phase::Report)?;
        let doc = report::rebuild(&ctx.dir)?;
        ctx.log.append(&report::render_table(&doc));
        Ok(())
    }

    /// Teardown always runs; the causal error, if any, is re-raised after
    /// the reclaimer has had its turn.
    async fn finish(
        &mut self,
        ctx: &ExperimentContext,
        provisioner: &Provisioner,
        outcome: Result<(), OrchestratorError>,
    ) -> Result<(), OrchestratorError> {
        if let Err(causal) = &outcome {
            ctx.note(&format!("failure in phase {}: {}", self.phase, causal));
        }
        if let Err(e) = self.transition(ctx, Phase::Teardown) {
            // Teardown is reachable from every non-terminal phase; landing
            // here means the walk itself is corrupted. Reclaim regardless.
            error!(error = %e, "phase walk violation entering teardown");
        }

        let var_file = ctx.dir.infra_vars_path();
        let reclaim = Reclaimer::new(self.cloud.clone())
            .reclaim(&ctx.id, Some((provisioner, var_file.as_path())))
            .await;

        match (outcome, reclaim) {
            (Err(causal), reclaim) => {
                match reclaim {
                    Ok(report) if report.is_clean() => {
                        ctx.note("teardown complete after failure")
                    }
                    Ok(report) => ctx.note(&format!(
                        "teardown left {} error(s): {}",
                        report.errors.len(),
                        report.errors.join("; ")
                    )),
                    Err(e) => ctx.note(&format!("teardown discovery failed: {}", e)),
                }
                let _ = self.transition(ctx, Phase::Failed);
                Err(causal)
            }
            (Ok(()), Ok(report)) if report.is_clean() => {
                ctx.note("teardown complete; no resources remain");
                Ok(())
            }
            (Ok(()), Ok(report)) => {
                let _ = self.transition(ctx, Phase::Failed);
                Err(OrchestratorError::ReclaimIncomplete(report.errors.join("; ")))
            }
            (Ok(()), Err(e)) => {
                let _ = self.transition(ctx, Phase::Failed);
                Err(e.into())
            }
        }
    }

    // ── Context and fleet persistence ─────────────────────────────────────────

    fn open_context(&self, id: &ExperimentId) -> Result<ExperimentContext, OrchestratorError> {
        let dir = self.store.open(id)?;
        let log = Arc::new(dir.log()?);
        Ok(ExperimentContext {
            id: id.clone(),
            dir,
            region: self.cloud.region().to_string(),
            tags: TagMap::new(),
            log,
        })
    }

    /// Generate the provisioner variables document. Default-tag injection
    /// happens here: the module stamps these on every resource it creates
    /// (plus the per-role Component tag).
    fn write_infra_vars(
        &self,
        ctx: &ExperimentContext,
        infra: &InfraConfig,
    ) -> Result<(), OrchestratorError> {
        let doc = serde_json::json!({
            "cluster_name": infra.cluster_name,
            "region": infra.region,
            "coordinator_count": infra.roles.coordinator.count,
            "coordinator_instance_type": infra.roles.coordinator.instance_type,
            "storage_count": infra.roles.storage.count,
            "storage_instance_type": infra.roles.storage.instance_type,
            "broker_count": infra.roles.broker.count,
            "broker_instance_type": infra.roles.broker.instance_type,
            "worker_count": infra.roles.worker.count,
            "worker_instance_type": infra.roles.worker.instance_type,
            "storage_volume_gb": infra.storage.volume_gb,
            "storage_volume_type": infra.storage.volume_type,
            "default_tags": ctx.tags,
        });
        let path = ctx.dir.infra_vars_path();
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(&doc)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?,
        )
        .map_err(|e| {
            OrchestratorError::Internal(format!("write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    fn write_fleet(&self, ctx: &ExperimentContext, fleet: &Fleet) -> Result<(), OrchestratorError> {
        let path = ctx.dir.path.join("fleet.json");
        std::fs::write(
            &path,
            serde_json::to_vec_pretty(fleet)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?,
        )
        .map_err(|e| OrchestratorError::Internal(format!("write {}: {}", path.display(), e)))
    }

    fn read_fleet(&self, ctx: &ExperimentContext) -> Result<Fleet, OrchestratorError> {
        let path = ctx.dir.path.join("fleet.json");
        let bytes = std::fs::read(&path).map_err(|e| {
            OrchestratorError::Internal(format!(
                "no fleet record at {} (was setup run?): {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::Internal(format!("parse fleet record: {}", e)))?)
    }
}

/// Last-resort leak detector at the sequencer boundary. Every exit path
/// disarms it after the reclaimer has run; dropping it armed means a code
/// path skipped cleanup, which is loud in the log and tells the operator
/// how to recover.
struct CleanupGuard {
    experiment: ExperimentId,
    armed: bool,
}

impl CleanupGuard {
    fn new(experiment: ExperimentId) -> Self {
        Self { experiment, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            error!(
                experiment = %self.experiment,
                "experiment dropped without teardown; run `mqlab teardown --experiment-id {}`",
                self.experiment
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqlab_cloud::{BaseUrls, StaticCredentials};
    use mqlab_config::{RoleSpec, RolesSpec, StorageSpec};

    fn offline_cloud() -> Arc<CloudClient> {
        Arc::new(CloudClient::with_endpoints(
            "us-east-1",
            BaseUrls {
                ec2: "http://127.0.0.1:1/ec2".into(),
                ssm: "http://127.0.0.1:1/ssm".into(),
            },
            StaticCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
                session_token: None,
            },
        ))
    }

    fn infra(module_dir: &std::path::Path) -> InfraConfig {
        let spec = |t: &str| RoleSpec { count: 1, instance_type: t.into() };
        InfraConfig {
            cluster_name: "perf-lab".into(),
            project: "pulsar-lab".into(),
            region: "us-east-1".into(),
            module_dir: module_dir.to_path_buf(),
            provisioner: None,
            roles: RolesSpec {
                coordinator: spec("m5.large"),
                storage: spec("i3.2xlarge"),
                broker: spec("m5.4xlarge"),
                worker: spec("c5.2xlarge"),
            },
            storage: StorageSpec { volume_gb: 500, volume_type: "gp3".into() },
            tags: [("Team".to_string(), "perf".to_string())].into_iter().collect(),
        }
    }

    fn sequencer(root: &std::path::Path) -> Sequencer {
        Sequencer::new(
            offline_cloud(),
            ExperimentStore::new(root),
            CancellationToken::new(),
        )
    }

    #[test]
    fn init_writes_vars_and_points_latest() {
        let root = tempfile::tempdir().unwrap();
        let mut seq = sequencer(root.path());
        let ctx = seq.init(&infra(root.path()), &TagMap::new(), None).unwrap();

        assert!(ctx.dir.infra_vars_path().is_file());
        let store = ExperimentStore::new(root.path());
        assert_eq!(store.latest().unwrap().as_ref(), Some(&ctx.id));

        let vars: serde_json::Value =
            serde_json::from_slice(&std::fs::read(ctx.dir.infra_vars_path()).unwrap()).unwrap();
        assert_eq!(vars["broker_instance_type"], "m5.4xlarge");
        assert_eq!(vars["default_tags"]["ExperimentID"], ctx.id.as_str());
        assert_eq!(vars["default_tags"]["ManagedBy"], "mqlab");
        assert_eq!(vars["default_tags"]["Team"], "perf");
    }

    #[test]
    fn cli_tags_override_config_tags() {
        let root = tempfile::tempdir().unwrap();
        let mut seq = sequencer(root.path());
        let cli: TagMap = [("Team".to_string(), "override".to_string())].into_iter().collect();
        let ctx = seq.init(&infra(root.path()), &cli, None).unwrap();
        assert_eq!(ctx.tags.get("Team").map(String::as_str), Some("override"));
    }

    #[test]
    fn transition_rejects_illegal_walks() {
        let root = tempfile::tempdir().unwrap();
        let mut seq = sequencer(root.path());
        let ctx = seq.init(&infra(root.path()), &TagMap::new(), None).unwrap();

        assert!(seq.transition(&ctx, Phase::RunMatrix).is_err());
        assert_eq!(seq.phase(), Phase::Init, "failed transition must not move the phase");

        seq.transition(&ctx, Phase::Provision).unwrap();
        seq.transition(&ctx, Phase::Converge).unwrap();
        seq.transition(&ctx, Phase::Teardown).unwrap();
        assert!(seq.transition(&ctx, Phase::RunMatrix).is_err());
        seq.transition(&ctx, Phase::Failed).unwrap();
    }

    #[test]
    fn fleet_record_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let mut seq = sequencer(root.path());
        let ctx = seq.init(&infra(root.path()), &TagMap::new(), None).unwrap();

        let fleet = Fleet {
            hosts: vec![mqlab_domain::Host {
                id: "i-0aaa".into(),
                private_ip: "10.0.0.1".into(),
                role: mqlab_domain::Role::Worker,
            }],
        };
        seq.write_fleet(&ctx, &fleet).unwrap();
        let back = seq.read_fleet(&ctx).unwrap();
        assert_eq!(back.hosts.len(), 1);
        assert_eq!(back.hosts[0].id, "i-0aaa");
    }
}
