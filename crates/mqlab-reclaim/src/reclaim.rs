use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mqlab_cloud::{wait_for, Backoff, CloudClient, CloudError, GatewayInfo, Provisioner};
use mqlab_domain::ExperimentId;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ReclaimError;

/// How long to wait for requested instance terminations to propagate.
/// Expiry is tolerated: compute deletion completes eventually and the
/// remaining kinds tolerate dangling references.
const TERMINATION_WAIT: Duration = Duration::from_secs(600);

/// Attempts per tag enumeration before discovery counts as failed; the tag
/// index is eventually consistent and can briefly miss fresh resources.
const DISCOVERY_ATTEMPTS: u32 = 3;

/// Tag-scoped discover-and-destroy. Works from the cloud's own tag index
/// alone — no provisioner state file is consulted — so it serves both as
/// graceful teardown and as the crash-path cleanup an operator invokes
/// against a dead experiment.
pub struct Reclaimer {
    cloud: Arc<CloudClient>,
}

/// Everything currently carrying the experiment tag, partitioned by kind.
/// Transient: materialised per invocation, never persisted.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReclaimPlan {
    pub instances: Vec<String>,
    pub volumes: Vec<String>,
    pub security_groups: Vec<String>,
    pub subnets: Vec<String>,
    pub route_tables: Vec<String>,
    #[serde(serialize_with = "gateway_ids")]
    pub internet_gateways: Vec<GatewayInfo>,
    pub vpcs: Vec<String>,
}

fn gateway_ids<S: serde::Serializer>(
    gateways: &[GatewayInfo],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(gateways.iter().map(|g| &g.id))
}

impl ReclaimPlan {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.instances.len()
            + self.volumes.len()
            + self.security_groups.len()
            + self.subnets.len()
            + self.route_tables.len()
            + self.internet_gateways.len()
            + self.vpcs.len()
    }
}

/// Outcome of one reclaim run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReclaimReport {
    pub destroyed: usize,
    /// Deletions that failed with something other than "not found".
    pub errors: Vec<String>,
    pub provisioner_destroy_failed: bool,
}

impl ReclaimReport {
    /// Clean means the tag scope is believed empty: everything discovered
    /// was destroyed (or already gone).
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Reclaimer {
    pub fn new(cloud: Arc<CloudClient>) -> Self {
        Self { cloud }
    }

    /// Produce the reclaim plan without side effects.
    pub async fn plan(&self, experiment: &ExperimentId) -> Result<ReclaimPlan, ReclaimError> {
        Ok(ReclaimPlan {
            instances: self
                .discover("instances", || {
                    let cloud = &self.cloud;
                    async move {
                        let infos = cloud.describe_instances_by_tag(experiment).await?;
                        Ok(infos
                            .into_iter()
                            .filter(|i| i.state != "terminated")
                            .map(|i| i.id)
                            .collect())
                    }
                })
                .await?,
            volumes: self
                .discover("volumes", || self.cloud.volumes_by_tag(experiment))
                .await?,
            security_groups: self
                .discover("security groups", || self.cloud.security_groups_by_tag(experiment))
                .await?,
            subnets: self
                .discover("subnets", || self.cloud.subnets_by_tag(experiment))
                .await?,
            route_tables: self
                .discover("route tables", || self.cloud.route_tables_by_tag(experiment))
                .await?,
            internet_gateways: self
                .discover("internet gateways", || {
                    self.cloud.internet_gateways_by_tag(experiment)
                })
                .await?,
            vpcs: self.discover("vpcs", || self.cloud.vpcs_by_tag(experiment)).await?,
        })
    }

    /// Destroy everything tagged with the experiment id, in dependency
    /// order. When a provisioner and its variables document are supplied
    /// (graceful mode), its `destroy` runs first; tag-based reclaim runs
    /// afterwards in either mode and is the final authority.
    ///
    /// Never cancellable: once entered it runs to completion, otherwise
    /// resources leak.
    pub async fn reclaim(
        &self,
        experiment: &ExperimentId,
        provisioner: Option<(&Provisioner, &Path)>,
    ) -> Result<ReclaimReport, ReclaimError> {
        let mut report = ReclaimReport::default();

        if let Some((provisioner, var_file)) = provisioner {
            info!(experiment = %experiment, "running provisioner destroy before tag sweep");
            if let Err(e) = provisioner.destroy(var_file).await {
                // No retry: the tag sweep below is the final authority.
                warn!(error = %e, "provisioner destroy failed; falling back to tag reclaim");
                report.provisioner_destroy_failed = true;
            }
        }

        info!(experiment = %experiment, "tag-scoped reclaim starting");

        // 1. Compute. Request termination of everything still alive, then
        //    hold at the barrier until the cloud reports it terminated.
        let plan = self.plan(experiment).await?;
        if !plan.instances.is_empty() {
            match self.cloud.terminate_instances(&plan.instances).await {
                Ok(()) => {
                    report.destroyed += plan.instances.len();
                    self.await_termination(experiment).await;
                }
                Err(e) if e.is_not_found() => report.destroyed += plan.instances.len(),
                Err(e) => report.errors.push(format!("terminate instances: {}", e)),
            }
        }

        // 2–5. Remaining kinds in dependency order. "Not found" is success;
        // each kind is re-enumerated so the sweep is safe to re-run.
        self.delete_each(&plan.volumes, &mut report, |id| self.cloud.delete_volume(id))
            .await;
        self.delete_each(&plan.security_groups, &mut report, |id| {
            self.cloud.delete_security_group(id)
        })
        .await;
        self.delete_each(&plan.subnets, &mut report, |id| self.cloud.delete_subnet(id))
            .await;
        self.delete_each(&plan.route_tables, &mut report, |id| {
            self.cloud.delete_route_table(id)
        })
        .await;

        for gateway in &plan.internet_gateways {
            for vpc in &gateway.attached_vpcs {
                if let Err(e) = self.cloud.detach_internet_gateway(&gateway.id, vpc).await {
                    if !e.is_not_found() {
                        report.errors.push(format!("detach {}: {}", gateway.id, e));
                    }
                }
            }
        }
        let gateway_ids: Vec<String> =
            plan.internet_gateways.iter().map(|g| g.id.clone()).collect();
        self.delete_each(&gateway_ids, &mut report, |id| {
            self.cloud.delete_internet_gateway(id)
        })
        .await;

        self.delete_each(&plan.vpcs, &mut report, |id| self.cloud.delete_vpc(id))
            .await;

        info!(
            experiment = %experiment,
            destroyed = report.destroyed,
            errors = report.errors.len(),
            "tag-scoped reclaim finished"
        );
        Ok(report)
    }

    /// Poll until every tagged instance reports terminated, bounded by
    /// `TERMINATION_WAIT`. Expiry logs and continues.
    async fn await_termination(&self, experiment: &ExperimentId) {
        // Reclaim ignores upstream cancellation by construction.
        let no_cancel = CancellationToken::new();
        let outcome = wait_for(
            "instance termination",
            Backoff::poll(),
            TERMINATION_WAIT,
            &no_cancel,
            || {
                let cloud = &self.cloud;
                async move {
                    let infos = cloud.describe_instances_by_tag(experiment).await?;
                    let all_done = infos.iter().all(|i| i.state == "terminated");
                    Ok(all_done.then_some(()))
                }
            },
        )
        .await;
        if outcome.is_err() {
            warn!("instance termination still propagating; continuing with remaining kinds");
        }
    }

    async fn delete_each<'a, F, Fut>(
        &self,
        ids: &'a [String],
        report: &mut ReclaimReport,
        delete: F,
    ) where
        F: Fn(&'a str) -> Fut,
        Fut: Future<Output = Result<(), CloudError>>,
    {
        for id in ids {
            match delete(id).await {
                Ok(()) => report.destroyed += 1,
                Err(e) if e.is_not_found() => report.destroyed += 1,
                Err(e) => report.errors.push(format!("{}: {}", id, e)),
            }
        }
    }

    /// Bounded-retry tag enumeration; the tag index is eventually
    /// consistent and list calls can fail transiently.
    async fn discover<T, F, Fut>(&self, kind: &'static str, list: F) -> Result<T, ReclaimError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let backoff = Backoff::poll();
        let mut last_err = None;
        for attempt in 0..DISCOVERY_ATTEMPTS {
            match list().await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    warn!(kind, attempt, error = %e, "tag enumeration failed");
                    last_err = Some(e);
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
            }
        }
        Err(ReclaimError::Discovery {
            kind,
            source: last_err.unwrap_or(CloudError::Internal("no attempts made".into())),
        })
    }
}
