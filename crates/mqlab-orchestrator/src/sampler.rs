use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use mqlab_domain::{HealthSnapshot, Host};
use mqlab_exec::Executor;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::OrchestratorError;

/// Default sampling cadence.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(30);

/// Deadline for one metrics scrape command.
const SCRAPE_DEADLINE: Duration = Duration::from_secs(60);

/// One shell pipeline, run on the host, that emits the health JSON the
/// sampler appends: heap and GC from the JVM, CPU and memory from /proc.
const SCRAPE_COMMAND: &str = r#"pid=$(pgrep -of java || true)
if [ -n "$pid" ]; then set -- $(jstat -gc "$pid" 2>/dev/null | awk 'NR==2 {print int($3+$4+$6+$8), int($13), int($15)}'); heap=${1:-0}; young=${2:-0}; old=${3:-0}; else heap=0; young=0; old=0; fi
cpu=$(cut -d' ' -f1 /proc/loadavg)
mem=$(awk '/MemAvailable/ {print int($2/1024)}' /proc/meminfo)
printf '{"heap_used_kb":%s,"gc_young":%s,"gc_old":%s,"cpu_load_1m":%s,"mem_available_mb":%s}' "$heap" "$young" "$old" "$cpu" "$mem""#;

/// Background infrastructure-health sampler. Exactly one runs during a
/// variant; it owns the only shared-mutable buffer in the orchestrator
/// (single writer here, single reader after stop).
///
/// A scrape failure logs a warning and skips that host for the period; the
/// sampler never fails the enclosing test.
pub struct Sampler {
    handle: Option<JoinHandle<()>>,
    token: CancellationToken,
    buffer: Arc<Mutex<Vec<HealthSnapshot>>>,
}

impl Sampler {
    /// Start sampling `hosts` every `period`. The task stops when `stop` is
    /// called or the parent token is cancelled.
    pub fn start(
        executor: Arc<Executor>,
        hosts: Vec<Host>,
        period: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let task_token = token.clone();
        let task_buffer = buffer.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for host in &hosts {
                    scrape(&executor, host, &task_buffer, &task_token).await;
                }
            }
        });

        Self {
            handle: Some(handle),
            token,
            buffer,
        }
    }

    /// A sampler that never started; `stop` on it is a no-op. Keeps
    /// start/stop total for callers that sample conditionally.
    pub fn idle() -> Self {
        Self {
            handle: None,
            token: CancellationToken::new(),
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stop sampling and hand the collected series to the caller.
    pub async fn stop(mut self) -> Vec<HealthSnapshot> {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "sampler task did not shut down cleanly");
            }
        }
        match Arc::try_unwrap(self.buffer) {
            Ok(mutex) => mutex.into_inner().unwrap_or_default(),
            Err(shared) => shared.lock().map(|buf| buf.clone()).unwrap_or_default(),
        }
    }
}

async fn scrape(
    executor: &Executor,
    host: &Host,
    buffer: &Mutex<Vec<HealthSnapshot>>,
    cancel: &CancellationToken,
) {
    let payload = vec![SCRAPE_COMMAND.to_string()];
    let result = match executor.run(&host.id, &payload, SCRAPE_DEADLINE, cancel).await {
        Ok(result) => result,
        Err(e) => {
            warn!(host = %host.id, error = %e, "metrics scrape failed; skipping host this period");
            return;
        }
    };

    let parsed: serde_json::Value = match serde_json::from_str(result.stdout.trim()) {
        Ok(v) => v,
        Err(e) => {
            warn!(host = %host.id, error = %e, "metrics scrape emitted malformed JSON");
            return;
        }
    };

    let snapshot = HealthSnapshot {
        at: Utc::now(),
        host: host.id.clone(),
        role: host.role,
        heap_used_kb: parsed["heap_used_kb"].as_u64().unwrap_or(0),
        gc_young: parsed["gc_young"].as_u64().unwrap_or(0),
        gc_old: parsed["gc_old"].as_u64().unwrap_or(0),
        cpu_load_1m: parsed["cpu_load_1m"].as_f64().unwrap_or(0.0),
        mem_available_mb: parsed["mem_available_mb"].as_u64().unwrap_or(0),
    };
    debug!(host = %host.id, heap_kb = snapshot.heap_used_kb, "health snapshot");
    if let Ok(mut buf) = buffer.lock() {
        buf.push(snapshot);
    }
}

/// Flush a collected series into the variant's metrics directory: the raw
/// time-series plus a chart-data document in a plot-friendly shape.
pub fn write_series(
    dir: &Path,
    snapshots: &[HealthSnapshot],
) -> Result<(), OrchestratorError> {
    let series_path = dir.join("metrics.json");
    let doc = serde_json::to_vec_pretty(snapshots)
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    std::fs::write(&series_path, doc)
        .map_err(|e| OrchestratorError::Internal(format!("write {}: {}", series_path.display(), e)))?;

    let chart_path = dir.join("chart.json");
    let chart = chart_data(snapshots);
    std::fs::write(
        &chart_path,
        serde_json::to_vec_pretty(&chart).map_err(|e| OrchestratorError::Internal(e.to_string()))?,
    )
    .map_err(|e| OrchestratorError::Internal(format!("write {}: {}", chart_path.display(), e)))?;
    Ok(())
}

/// Pivot the series per metric, per host: `[{metric, series: [{host,
/// points: [[epoch_s, value]]}]}]`.
fn chart_data(snapshots: &[HealthSnapshot]) -> serde_json::Value {
    let metrics: [(&str, fn(&HealthSnapshot) -> f64); 5] = [
        ("heap_used_kb", |s| s.heap_used_kb as f64),
        ("gc_young", |s| s.gc_young as f64),
        ("gc_old", |s| s.gc_old as f64),
        ("cpu_load_1m", |s| s.cpu_load_1m),
        ("mem_available_mb", |s| s.mem_available_mb as f64),
    ];

    let mut hosts: Vec<&str> = snapshots.iter().map(|s| s.host.as_str()).collect();
    hosts.sort_unstable();
    hosts.dedup();

    let metric_docs: Vec<serde_json::Value> = metrics
        .iter()
        .map(|(name, extract)| {
            let series: Vec<serde_json::Value> = hosts
                .iter()
                .map(|host| {
                    let points: Vec<serde_json::Value> = snapshots
                        .iter()
                        .filter(|s| s.host == *host)
                        .map(|s| serde_json::json!([s.at.timestamp(), extract(s)]))
                        .collect();
                    serde_json::json!({ "host": host, "points": points })
                })
                .collect();
            serde_json::json!({ "metric": name, "series": series })
        })
        .collect();

    serde_json::json!({ "metrics": metric_docs })
}
