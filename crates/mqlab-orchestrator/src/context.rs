use std::sync::Arc;

use mqlab_domain::{ExperimentId, TagMap};
use mqlab_store::{ExperimentDir, ExperimentLog};

/// Immutable per-experiment context handed to every component. The only
/// mutable state in the orchestrator lives elsewhere: the sequencer's phase
/// field and the sampler's buffer.
#[derive(Clone)]
pub struct ExperimentContext {
    pub id: ExperimentId,
    pub dir: ExperimentDir,
    pub region: String,
    /// Full merged tag set (required keys + config + CLI overrides).
    pub tags: TagMap,
    pub log: Arc<ExperimentLog>,
}

impl ExperimentContext {
    /// Log to both the experiment log file and the process log.
    pub fn note(&self, line: &str) {
        tracing::info!(experiment = %self.id, "{}", line);
        self.log.append(line);
    }
}
