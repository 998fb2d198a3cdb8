use std::path::{Path, PathBuf};
use std::sync::Arc;

use mqlab_cloud::CloudClient;
use mqlab_config::{load_infra, load_test_plan};
use mqlab_domain::{ExperimentId, TagMap};
use mqlab_orchestrator::{report, OrchestratorError, Sequencer};
use mqlab_reclaim::Reclaimer;
use mqlab_store::ExperimentStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::output;

const DEFAULT_REGION: &str = "us-east-1";

pub struct App {
    pub root: Option<PathBuf>,
    pub region: Option<String>,
    pub cancel: CancellationToken,
}

impl App {
    fn store(&self) -> ExperimentStore {
        match &self.root {
            Some(root) => ExperimentStore::new(root.clone()),
            None => ExperimentStore::new(ExperimentStore::default_root()),
        }
    }

    fn sequencer(&self, region: &str) -> Sequencer {
        let cloud = Arc::new(CloudClient::new(region));
        Sequencer::new(cloud, self.store(), self.cancel.clone())
    }

    fn region(&self) -> String {
        self.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    fn resolve(&self, selector: &str) -> Result<ExperimentId, OrchestratorError> {
        match self.store().resolve(selector) {
            Ok(id) => Ok(id),
            // A malformed id is an invocation error, not an operational one.
            Err(mqlab_store::StoreError::Domain(e)) => {
                Err(OrchestratorError::ConfigInvalid(e.into()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn tag_map(tags: Vec<(String, String)>) -> TagMap {
    tags.into_iter().collect()
}

fn id_override(id: Option<String>) -> Result<Option<ExperimentId>, OrchestratorError> {
    id.map(ExperimentId::parse)
        .transpose()
        .map_err(|e| OrchestratorError::ConfigInvalid(e.into()))
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn full(
    app: &App,
    config: &Path,
    test_plan: &Path,
    experiment_id: Option<String>,
    tags: Vec<(String, String)>,
) -> Result<(), OrchestratorError> {
    let infra = load_infra(config)?;
    let matrix = load_test_plan(test_plan)?;
    let mut sequencer = app.sequencer(&infra.region);

    let id = sequencer
        .run_full(&infra, &matrix, &tag_map(tags), id_override(experiment_id)?)
        .await?;
    println!("experiment {} complete", id);

    let doc = sequencer.report(&id)?;
    print!("{}", report::render_table(&doc));
    Ok(())
}

pub async fn setup(
    app: &App,
    config: &Path,
    experiment_id: Option<String>,
    tags: Vec<(String, String)>,
) -> Result<(), OrchestratorError> {
    let infra = load_infra(config)?;
    let mut sequencer = app.sequencer(&infra.region);

    let id = sequencer
        .setup(&infra, &tag_map(tags), id_override(experiment_id)?)
        .await?;
    println!("cluster for {} is running; tear it down with:", id);
    println!("  mqlab teardown --experiment-id {}", id);
    Ok(())
}

pub async fn run(app: &App, test_plan: &Path, selector: &str) -> Result<(), OrchestratorError> {
    let matrix = load_test_plan(test_plan)?;
    let id = app.resolve(selector)?;
    let mut sequencer = app.sequencer(&app.region());

    let doc = sequencer.run_matrix(&matrix, &id).await?;
    print!("{}", report::render_table(&doc));
    Ok(())
}

pub async fn report(app: &App, selector: &str) -> Result<(), OrchestratorError> {
    let id = app.resolve(selector)?;
    let sequencer = app.sequencer(&app.region());
    let doc = sequencer.report(&id)?;
    print!("{}", report::render_table(&doc));
    Ok(())
}

pub async fn teardown(app: &App, selector: &str, dry_run: bool) -> Result<(), OrchestratorError> {
    let id = app.resolve(selector)?;

    if dry_run {
        let cloud = Arc::new(CloudClient::new(&app.region()));
        let plan = Reclaimer::new(cloud).plan(&id).await?;
        print!("{}", output::render_plan(&id, &plan));
        return Ok(());
    }

    info!(experiment = %id, "tearing down");
    let mut sequencer = app.sequencer(&app.region());
    sequencer.teardown(&id).await?;
    println!("experiment {} reclaimed", id);
    Ok(())
}

pub fn list(app: &App) -> Result<(), OrchestratorError> {
    let summaries = app.store().list()?;
    print!("{}", output::render_list(&summaries));
    Ok(())
}
