use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ── Workload ──────────────────────────────────────────────────────────────────

/// The fully-typed benchmark workload. A matrix carries one base workload;
/// each variant overlays overrides onto it to produce a workload artefact.
/// Every field here has a default, so a merged artefact is always complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub topics: u32,
    pub partitions_per_topic: u32,
    pub producers_per_topic: u32,
    pub subscriptions_per_topic: u32,
    pub consumers_per_subscription: u32,
    pub message_size: MessageSize,
    /// Target publish rate in msg/s. 0 means unthrottled (max-rate runs).
    pub producer_rate: u64,
    pub test_duration_minutes: u64,
    pub warmup_duration_minutes: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            topics: 1,
            partitions_per_topic: 16,
            producers_per_topic: 1,
            subscriptions_per_topic: 1,
            consumers_per_subscription: 1,
            message_size: MessageSize::Fixed(1024),
            producer_rate: 10_000,
            test_duration_minutes: 5,
            warmup_duration_minutes: 1,
        }
    }
}

// ── Message size ──────────────────────────────────────────────────────────────

/// Fixed byte size, or a weight-bucketed distribution keyed `"<lo>-<hi>"`.
/// Distribution weights are normalised to sum 1.0 at merge time; the remote
/// benchmark draws a bucket per message, weighted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSize {
    Fixed(u32),
    Distribution(BTreeMap<String, f64>),
}

impl MessageSize {
    /// Validate bucket keys and normalise distribution weights in place.
    pub fn normalise(&mut self) -> Result<(), DomainError> {
        let MessageSize::Distribution(buckets) = self else {
            return Ok(());
        };
        if buckets.is_empty() {
            return Err(DomainError::InvalidSizeBucket("empty distribution".into()));
        }
        let mut total = 0.0;
        for (key, weight) in buckets.iter() {
            let (lo, hi) = parse_bucket(key)?;
            if lo > hi {
                return Err(DomainError::InvalidSizeBucket(key.clone()));
            }
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(DomainError::InvalidSizeBucket(format!(
                    "{} (weight {})",
                    key, weight
                )));
            }
            total += *weight;
        }
        for weight in buckets.values_mut() {
            *weight /= total;
        }
        Ok(())
    }
}

fn parse_bucket(key: &str) -> Result<(u32, u32), DomainError> {
    let (lo, hi) = key
        .split_once('-')
        .ok_or_else(|| DomainError::InvalidSizeBucket(key.to_string()))?;
    let lo = lo
        .trim()
        .parse::<u32>()
        .map_err(|_| DomainError::InvalidSizeBucket(key.to_string()))?;
    let hi = hi
        .trim()
        .parse::<u32>()
        .map_err(|_| DomainError::InvalidSizeBucket(key.to_string()))?;
    Ok((lo, hi))
}

// ── Test matrix ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    FixedRate,
    RampUp,
    MaxRate,
}

impl VariantKind {
    pub fn parse(s: &str) -> Result<VariantKind, DomainError> {
        match s {
            "fixed_rate" => Ok(VariantKind::FixedRate),
            "ramp_up" => Ok(VariantKind::RampUp),
            "max_rate" => Ok(VariantKind::MaxRate),
            other => Err(DomainError::InvalidVariantKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for VariantKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VariantKind::FixedRate => "fixed_rate",
            VariantKind::RampUp => "ramp_up",
            VariantKind::MaxRate => "max_rate",
        };
        write!(f, "{}", s)
    }
}

/// One row of the test matrix. Variants run strictly in declared order;
/// variant n starts only after n−1 has terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVariant {
    pub name: String,
    pub kind: VariantKind,
    /// Expected throughput in msg/s; the plateau policy compares against it.
    pub target_rate: Option<f64>,
    /// Workload field overrides, applied over the matrix base workload.
    pub overrides: BTreeMap<String, serde_json::Value>,
}

/// Aborts the remainder of a matrix when achieved throughput persistently
/// misses target by more than the allowed deviation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlateauPolicy {
    pub allowed_deviation_pct: f64,
    pub consecutive_fails_allowed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMatrix {
    pub name: String,
    pub base: Workload,
    pub variants: Vec<TestVariant>,
    pub plateau: Option<PlateauPolicy>,
}

impl TestMatrix {
    /// Variant names must be unique within a matrix.
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut seen = std::collections::BTreeSet::new();
        for v in &self.variants {
            if !seen.insert(v.name.as_str()) {
                return Err(DomainError::DuplicateVariant(v.name.clone()));
            }
        }
        Ok(())
    }
}

/// Terminal outcome of one variant, as recorded in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantOutcome {
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for VariantOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VariantOutcome::Passed => "passed",
            VariantOutcome::Failed => "failed",
            VariantOutcome::Skipped => "skipped",
            VariantOutcome::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}
