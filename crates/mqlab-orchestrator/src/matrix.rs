use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mqlab_config::{merge_workload, render_artefact};
use mqlab_domain::{
    Fleet, Host, Role, TestMatrix, TestVariant, VariantOutcome, Workload, BENCHMARK_BIN,
};
use mqlab_exec::{ExecError, Executor};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::ExperimentContext;
use crate::error::OrchestratorError;
use crate::sampler::{self, Sampler, SAMPLE_PERIOD};

const REMOTE_WORKLOAD_DIR: &str = "/opt/mqlab/workloads";
const REMOTE_RESULTS_DIR: &str = "/opt/mqlab/results";

/// Scheduling headroom added around the configured test window.
const SLACK: Duration = Duration::from_secs(300);

/// Parsed summary metrics of one benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchSummary {
    pub throughput_msg_s: f64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_p999_ms: f64,
}

/// Terminal state of one variant, as handed to the report phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRecord {
    pub name: String,
    pub outcome: VariantOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BenchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

enum VariantError {
    Cancelled,
    Failed(String),
    Fatal(OrchestratorError),
}

impl From<ExecError> for VariantError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Cancelled { .. } => VariantError::Cancelled,
            other => VariantError::Failed(other.to_string()),
        }
    }
}

/// Executes a matrix: variants strictly in declared order, each one
/// materialised to a workload artefact, shipped to a worker, run, and
/// collected, with the sampler covering the whole window (warmup included).
pub struct MatrixRunner {
    executor: Arc<Executor>,
}

impl MatrixRunner {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        ctx: &ExperimentContext,
        matrix: &TestMatrix,
        fleet: &Fleet,
        cancel: &CancellationToken,
    ) -> Result<Vec<VariantRecord>, OrchestratorError> {
        matrix
            .validate()
            .map_err(|e| OrchestratorError::ConfigInvalid(e.into()))?;
        let workers = fleet.workers();
        if workers.is_empty() {
            return Err(OrchestratorError::Internal("fleet has no worker hosts".into()));
        }
        let sampled: Vec<Host> = fleet
            .hosts
            .iter()
            .filter(|h| matches!(h.role, Role::Broker | Role::Storage))
            .cloned()
            .collect();

        let mut records = Vec::with_capacity(matrix.variants.len());
        let mut consecutive_misses = 0u32;
        let mut plateau_hit = false;

        for (index, variant) in matrix.variants.iter().enumerate() {
            if plateau_hit {
                ctx.note(&format!("variant '{}' skipped: plateau policy", variant.name));
                let record = VariantRecord {
                    name: variant.name.clone(),
                    outcome: VariantOutcome::Skipped,
                    summary: None,
                    detail: Some("plateau policy aborted the remaining matrix".into()),
                };
                self.write_terminal(ctx, &record)?;
                records.push(record);
                continue;
            }
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            // Round-robin worker pick; sequential variants mean at most one
            // benchmark is in flight per worker at any instant.
            let worker = workers[index % workers.len()];
            ctx.note(&format!(
                "variant '{}' starting on worker {}",
                variant.name, worker.id
            ));

            match self
                .run_variant(ctx, &matrix.base, variant, worker, &sampled, cancel)
                .await
            {
                Ok(summary) => {
                    if let (Some(policy), Some(target)) = (&matrix.plateau, variant.target_rate) {
                        let deviation =
                            ((summary.throughput_msg_s - target).abs() / target) * 100.0;
                        if deviation > policy.allowed_deviation_pct {
                            consecutive_misses += 1;
                            warn!(
                                variant = %variant.name,
                                deviation, misses = consecutive_misses,
                                "throughput plateaued below target"
                            );
                        } else {
                            consecutive_misses = 0;
                        }
                        if consecutive_misses >= policy.consecutive_fails_allowed {
                            ctx.note(&format!(
                                "plateau policy triggered after variant '{}'",
                                variant.name
                            ));
                            plateau_hit = true;
                        }
                    }
                    records.push(VariantRecord {
                        name: variant.name.clone(),
                        outcome: VariantOutcome::Passed,
                        summary: Some(summary),
                        detail: None,
                    });
                }
                Err(VariantError::Cancelled) => {
                    let record = VariantRecord {
                        name: variant.name.clone(),
                        outcome: VariantOutcome::Cancelled,
                        summary: None,
                        detail: Some("cancelled".into()),
                    };
                    self.write_terminal(ctx, &record)?;
                    return Err(OrchestratorError::Cancelled);
                }
                Err(VariantError::Failed(detail)) => {
                    // A failed variant does not abort the matrix.
                    warn!(variant = %variant.name, detail, "variant failed");
                    let record = VariantRecord {
                        name: variant.name.clone(),
                        outcome: VariantOutcome::Failed,
                        summary: None,
                        detail: Some(detail),
                    };
                    self.write_terminal(ctx, &record)?;
                    records.push(record);
                }
                Err(VariantError::Fatal(e)) => return Err(e),
            }
        }

        Ok(records)
    }

    async fn run_variant(
        &self,
        ctx: &ExperimentContext,
        base: &Workload,
        variant: &TestVariant,
        worker: &Host,
        sampled: &[Host],
        cancel: &CancellationToken,
    ) -> Result<BenchSummary, VariantError> {
        let merged = merge_workload(base, &variant.overrides)
            .map_err(|e| VariantError::Failed(e.to_string()))?;
        let artefact =
            render_artefact(&merged).map_err(|e| VariantError::Failed(e.to_string()))?;

        let workload_path = format!("{}/{}.yaml", REMOTE_WORKLOAD_DIR, variant.name);
        let output_path = format!("{}/{}.json", REMOTE_RESULTS_DIR, variant.name);
        self.executor
            .upload(&worker.id, &workload_path, artefact.as_bytes(), cancel)
            .await?;

        // The sampler starts before the benchmark so warmup is covered.
        let sampler = Sampler::start(
            self.executor.clone(),
            sampled.to_vec(),
            SAMPLE_PERIOD,
            cancel,
        );

        let window = Duration::from_secs(
            (merged.test_duration_minutes + merged.warmup_duration_minutes) * 60,
        );
        let deadline = window + 2 * SLACK;
        let bench = format!(
            "install -d {} && {} --workload {} --output {}",
            REMOTE_RESULTS_DIR, BENCHMARK_BIN, workload_path, output_path
        );
        let bench_result = self
            .executor
            .run(&worker.id, &[bench], deadline, cancel)
            .await;

        // Stop the sampler on every path before deciding the outcome.
        let series = sampler.stop().await;

        let _run = bench_result?;
        info!(variant = %variant.name, "benchmark finished, collecting output");

        let raw = self
            .executor
            .download(&worker.id, &output_path, cancel)
            .await?;
        let summary =
            parse_summary(&raw).map_err(|e| VariantError::Failed(format!("parse output: {}", e)))?;

        // Commit artefacts only once everything is in hand, so the result
        // directory is never a partial mixture.
        let metrics_dir = ctx
            .dir
            .variant_metrics_dir(&variant.name)
            .map_err(|e| VariantError::Fatal(e.into()))?;
        sampler::write_series(&metrics_dir, &series).map_err(VariantError::Fatal)?;

        let result_dir = ctx
            .dir
            .variant_result_dir(&variant.name)
            .map_err(|e| VariantError::Fatal(e.into()))?;
        std::fs::write(result_dir.join("raw.json"), &raw)
            .map_err(|e| VariantError::Fatal(OrchestratorError::Internal(e.to_string())))?;
        let summary_doc = serde_json::json!({
            "name": variant.name,
            "outcome": VariantOutcome::Passed,
            "summary": summary,
        });
        std::fs::write(
            result_dir.join("summary.json"),
            serde_json::to_vec_pretty(&summary_doc)
                .map_err(|e| VariantError::Fatal(OrchestratorError::Internal(e.to_string())))?,
        )
        .map_err(|e| VariantError::Fatal(OrchestratorError::Internal(e.to_string())))?;

        Ok(summary)
    }

    /// Write the terminal error record for a variant that did not pass.
    fn write_terminal(
        &self,
        ctx: &ExperimentContext,
        record: &VariantRecord,
    ) -> Result<(), OrchestratorError> {
        let dir = ctx.dir.variant_result_dir(&record.name)?;
        let doc = serde_json::json!({
            "name": record.name,
            "outcome": record.outcome,
            "detail": record.detail,
            "at": Utc::now(),
        });
        std::fs::write(
            dir.join("error.json"),
            serde_json::to_vec_pretty(&doc)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?,
        )
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        Ok(())
    }
}

/// Parse the benchmark's result document. Throughput is the mean of the
/// sampled publish rates; latencies come from the aggregated fields.
pub fn parse_summary(raw: &[u8]) -> Result<BenchSummary, String> {
    let doc: serde_json::Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;

    let rates = doc["publishRate"]
        .as_array()
        .ok_or_else(|| "missing publishRate".to_string())?;
    if rates.is_empty() {
        return Err("empty publishRate".into());
    }
    let sum: f64 = rates.iter().filter_map(|v| v.as_f64()).sum();
    let throughput = sum / rates.len() as f64;

    let field = |name: &str| {
        doc[name]
            .as_f64()
            .ok_or_else(|| format!("missing {}", name))
    };

    Ok(BenchSummary {
        throughput_msg_s: throughput,
        latency_avg_ms: field("aggregatedPublishLatencyAvg")?,
        latency_p50_ms: field("aggregatedPublishLatency50pct")?,
        latency_p99_ms: field("aggregatedPublishLatency99pct")?,
        latency_p999_ms: field("aggregatedPublishLatency999pct")?,
    })
}
