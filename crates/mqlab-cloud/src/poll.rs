use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CloudError;

// ── Backoff ───────────────────────────────────────────────────────────────────

/// An exponential backoff schedule: `initial`, multiplied by `factor` per
/// attempt, clamped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, factor: f64, cap: Duration) -> Self {
        Self { initial, factor, cap }
    }

    /// Readiness-probe schedule: 5 s start, ×1.5, 30 s cap.
    pub const fn probe() -> Self {
        Backoff::new(Duration::from_secs(5), 1.5, Duration::from_secs(30))
    }

    /// Command-poll schedule: 2 s start, ×1.5, 10 s cap.
    pub const fn poll() -> Self {
        Backoff::new(Duration::from_secs(2), 1.5, Duration::from_secs(10))
    }

    /// The delay before attempt `n` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

// ── wait_for ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("{label} did not become ready within {deadline:?}")]
    TimedOut { label: String, deadline: Duration },

    #[error("{label} aborted: {source}")]
    Aborted {
        label: String,
        #[source]
        source: CloudError,
    },

    #[error("{label} cancelled")]
    Cancelled { label: String },
}

/// Poll `check` until it yields a value, the deadline passes, or `cancel`
/// fires. The single wait-for-X-to-become-Y abstraction: components never
/// hand-roll sleep loops.
///
/// `check` returns:
/// - `Ok(Some(v))` — ready, `v` is handed back;
/// - `Ok(None)` — not yet, poll again after the next backoff delay;
/// - `Err(e)` — abort immediately (the condition can no longer be met).
pub async fn wait_for<T, F, Fut>(
    label: &str,
    backoff: Backoff,
    deadline: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, CloudError>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled { label: label.to_string() });
        }

        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            // Throttling is transient; treat like "not yet" and keep waiting.
            Err(e) if e.is_throttle() => {
                debug!(label, error = %e, "throttled while waiting; will retry");
            }
            Err(e) => {
                return Err(WaitError::Aborted { label: label.to_string(), source: e });
            }
        }

        let delay = backoff.delay(attempt);
        attempt += 1;

        if started.elapsed() + delay > deadline {
            return Err(WaitError::TimedOut { label: label.to_string(), deadline });
        }
        debug!(label, attempt, ?delay, "condition not met, waiting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled { label: label.to_string() });
            }
        }
    }
}
