use chrono::{DateTime, Utc};
use mqlab_store::ExperimentDir;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::OrchestratorError;
use crate::matrix::VariantRecord;

/// The aggregated experiment report, written to
/// `benchmark_results/summary.json` and rebuildable from stored artefacts
/// alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDoc {
    pub experiment: String,
    pub generated_at: DateTime<Utc>,
    pub variants: Vec<VariantRecord>,
}

/// Assemble the report from the per-variant files on disk and persist it.
/// Used both as the Report phase of a full run and by `mqlab report` on an
/// archived experiment.
pub fn rebuild(dir: &ExperimentDir) -> Result<ReportDoc, OrchestratorError> {
    let mut variants = Vec::new();

    let results_root = dir.results_dir();
    let entries = std::fs::read_dir(&results_root)
        .map_err(|e| OrchestratorError::Internal(format!("read {}: {}", results_root.display(), e)))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let record_file = ["summary.json", "error.json"]
            .iter()
            .map(|f| path.join(f))
            .find(|p| p.is_file());
        let Some(record_file) = record_file else {
            continue;
        };
        let bytes = std::fs::read(&record_file)
            .map_err(|e| OrchestratorError::Internal(format!("read {}: {}", record_file.display(), e)))?;
        let record: VariantRecord = serde_json::from_slice(&bytes)
            .map_err(|e| OrchestratorError::Internal(format!("parse {}: {}", record_file.display(), e)))?;
        variants.push(record);
    }
    variants.sort_by(|a, b| a.name.cmp(&b.name));

    let doc = ReportDoc {
        experiment: dir.id.to_string(),
        generated_at: Utc::now(),
        variants,
    };

    let out = results_root.join("summary.json");
    std::fs::write(
        &out,
        serde_json::to_vec_pretty(&doc).map_err(|e| OrchestratorError::Internal(e.to_string()))?,
    )
    .map_err(|e| OrchestratorError::Internal(format!("write {}: {}", out.display(), e)))?;
    info!(experiment = %dir.id, variants = doc.variants.len(), "report written");

    Ok(doc)
}

/// Render the report as a plain-text table for the log and the terminal.
pub fn render_table(doc: &ReportDoc) -> String {
    let mut out = String::new();
    out.push_str(&format!("Experiment {}\n", doc.experiment));
    out.push_str(&format!(
        "{:<24} {:<10} {:>14} {:>9} {:>9} {:>9}\n",
        "variant", "outcome", "msg/s", "p50 ms", "p99 ms", "p999 ms"
    ));
    for v in &doc.variants {
        match &v.summary {
            Some(s) => out.push_str(&format!(
                "{:<24} {:<10} {:>14.1} {:>9.2} {:>9.2} {:>9.2}\n",
                v.name, v.outcome, s.throughput_msg_s, s.latency_p50_ms, s.latency_p99_ms,
                s.latency_p999_ms
            )),
            None => out.push_str(&format!(
                "{:<24} {:<10} {}\n",
                v.name,
                v.outcome,
                v.detail.as_deref().unwrap_or("-")
            )),
        }
    }
    out
}
