use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use mqlab_domain::ExperimentId;
use tracing::debug;

use crate::error::{io_err, StoreError};
use crate::log::ExperimentLog;

const LATEST: &str = "latest";

/// The durable per-experiment directory tree:
///
/// ```text
/// <root>/<exp-id>/
///   orchestrator.log
///   infra_vars.json
///   benchmark_results/
///   metrics/
///   manifests/
/// <root>/latest        -> most recent <exp-id>
/// ```
pub struct ExperimentStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub id: ExperimentId,
    pub created_at: Option<DateTime<Utc>>,
    pub is_latest: bool,
}

impl ExperimentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$MQLAB_HOME/experiments`, defaulting to `~/.mqlab/experiments`.
    pub fn default_root() -> PathBuf {
        if let Ok(home) = std::env::var("MQLAB_HOME") {
            return PathBuf::from(home).join("experiments");
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".mqlab").join("experiments")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory tree for a new experiment and point `latest` at
    /// it. Runs before any cloud work.
    pub fn create(&self, id: &ExperimentId) -> Result<ExperimentDir, StoreError> {
        let dir = ExperimentDir {
            id: id.clone(),
            path: self.root.join(id.as_str()),
        };
        for path in [
            dir.path.clone(),
            dir.results_dir(),
            dir.metrics_dir(),
            dir.manifests_dir(),
        ] {
            std::fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        self.set_latest(id)?;
        debug!(id = %id, path = %dir.path.display(), "created experiment directory");
        Ok(dir)
    }

    /// Open an existing experiment directory.
    pub fn open(&self, id: &ExperimentId) -> Result<ExperimentDir, StoreError> {
        let path = self.root.join(id.as_str());
        if !path.is_dir() {
            return Err(StoreError::ExperimentNotFound(id.to_string()));
        }
        Ok(ExperimentDir { id: id.clone(), path })
    }

    /// Resolve an operator-supplied selector: either `latest` or an
    /// explicit experiment id.
    pub fn resolve(&self, selector: &str) -> Result<ExperimentId, StoreError> {
        if selector == LATEST {
            return self.latest()?.ok_or(StoreError::NoLatest);
        }
        Ok(ExperimentId::parse(selector)?)
    }

    /// The experiment the `latest` pointer currently names, if any.
    pub fn latest(&self) -> Result<Option<ExperimentId>, StoreError> {
        let link = self.root.join(LATEST);
        let target = match read_pointer(&link) {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(ExperimentId::parse(target).ok())
    }

    /// Repoint `latest` with write-and-rename semantics: observers never
    /// see a missing or broken pointer.
    pub fn set_latest(&self, id: &ExperimentId) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let tmp = self.root.join(format!(".{}.tmp", LATEST));
        let link = self.root.join(LATEST);

        if tmp.symlink_metadata().is_ok() {
            std::fs::remove_file(&tmp).map_err(|e| io_err(&tmp, e))?;
        }
        write_pointer(&tmp, id.as_str())?;
        std::fs::rename(&tmp, &link).map_err(|e| io_err(&link, e))?;
        Ok(())
    }

    /// Enumerate stored experiments, oldest first.
    pub fn list(&self) -> Result<Vec<ExperimentSummary>, StoreError> {
        let latest = self.latest()?;
        let mut out = Vec::new();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_err(&self.root, e)),
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Ok(id) = ExperimentId::parse(name.to_string_lossy().as_ref()) else {
                continue;
            };
            let created_at = creation_time(&id);
            let is_latest = latest.as_ref() == Some(&id);
            out.push(ExperimentSummary { id, created_at, is_latest });
        }
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }
}

/// The experiment's creation instant is encoded in its id.
fn creation_time(id: &ExperimentId) -> Option<DateTime<Utc>> {
    let stamp = id.as_str().strip_prefix("exp-")?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S").ok()?;
    Some(naive.and_utc())
}

#[cfg(unix)]
fn write_pointer(path: &Path, target: &str) -> Result<(), StoreError> {
    std::os::unix::fs::symlink(target, path).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn write_pointer(path: &Path, target: &str) -> Result<(), StoreError> {
    std::fs::write(path, target).map_err(|e| io_err(path, e))
}

fn read_pointer(link: &Path) -> Option<String> {
    if let Ok(target) = std::fs::read_link(link) {
        return Some(target.file_name()?.to_string_lossy().into_owned());
    }
    // Platform fallback: a plain file holding the id.
    std::fs::read_to_string(link).ok().map(|s| s.trim().to_string())
}

// ── ExperimentDir ─────────────────────────────────────────────────────────────

/// Handle to one experiment's directory. Path helpers only; writers are the
/// components named in the layout (sequencer → log, matrix runner →
/// benchmark_results, sampler → metrics, executor → manifests).
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    pub id: ExperimentId,
    pub path: PathBuf,
}

impl ExperimentDir {
    pub fn log_path(&self) -> PathBuf {
        self.path.join("orchestrator.log")
    }

    pub fn log(&self) -> Result<ExperimentLog, StoreError> {
        ExperimentLog::open(self.log_path())
    }

    pub fn infra_vars_path(&self) -> PathBuf {
        self.path.join("infra_vars.json")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.path.join("benchmark_results")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.path.join("metrics")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.path.join("manifests")
    }

    /// `benchmark_results/<variant>/` — raw + parsed results, or the
    /// terminal error record; never a partial mixture.
    pub fn variant_result_dir(&self, variant: &str) -> Result<PathBuf, StoreError> {
        let dir = self.results_dir().join(variant);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(dir)
    }

    /// `metrics/<variant>/` — the sampler's time-series artefacts.
    pub fn variant_metrics_dir(&self, variant: &str) -> Result<PathBuf, StoreError> {
        let dir = self.metrics_dir().join(variant);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ExperimentId {
        ExperimentId::parse(s).unwrap()
    }

    #[test]
    fn create_lays_out_directories_and_latest() {
        let root = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(root.path());
        let dir = store.create(&id("exp-20260801-100000")).unwrap();

        assert!(dir.results_dir().is_dir());
        assert!(dir.metrics_dir().is_dir());
        assert!(dir.manifests_dir().is_dir());
        assert_eq!(store.latest().unwrap(), Some(id("exp-20260801-100000")));
    }

    #[test]
    fn latest_repoints_atomically() {
        let root = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(root.path());
        store.create(&id("exp-20260801-100000")).unwrap();
        store.create(&id("exp-20260801-110000")).unwrap();

        assert_eq!(store.latest().unwrap(), Some(id("exp-20260801-110000")));
        // The pointer is always resolvable after repointing.
        assert_eq!(
            store.resolve("latest").unwrap(),
            id("exp-20260801-110000")
        );
    }

    #[test]
    fn resolve_accepts_explicit_ids_and_rejects_garbage() {
        let root = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(root.path());
        assert_eq!(
            store.resolve("exp-20260801-100000").unwrap(),
            id("exp-20260801-100000")
        );
        assert!(store.resolve("latest").is_err(), "no latest yet");
        assert!(store.resolve("not-an-id").is_err());
    }

    #[test]
    fn list_orders_by_id_and_flags_latest() {
        let root = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(root.path());
        store.create(&id("exp-20260801-110000")).unwrap();
        store.create(&id("exp-20260801-100000")).unwrap();

        let summaries = store.list().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, id("exp-20260801-100000"));
        assert!(summaries[0].is_latest, "latest points at most recent create");
        assert!(!summaries[1].is_latest);
        assert!(summaries[0].created_at.is_some());
    }

    #[test]
    fn open_requires_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = ExperimentStore::new(root.path());
        assert!(store.open(&id("exp-20260801-100000")).is_err());
        store.create(&id("exp-20260801-100000")).unwrap();
        assert!(store.open(&id("exp-20260801-100000")).is_ok());
    }
}
