use mqlab_cloud::CloudError;
use mqlab_config::ConfigError;
use mqlab_exec::ExecError;
use mqlab_reclaim::ReclaimError;
use mqlab_store::StoreError;
use thiserror::Error;

/// The failure taxonomy of one experiment run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected at the boundary; the Provision phase is never entered.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("provisioner failed: {0}")]
    ProvisionerFailed(String),

    #[error("readiness timeout in stage '{stage}': {detail}")]
    ReadinessTimeout { stage: &'static str, detail: String },

    #[error("remote execution failed: {0}")]
    ExecutionFailed(#[from] ExecError),

    #[error("resource discovery failed: {0}")]
    ResourceDiscoveryFailed(#[from] ReclaimError),

    /// Reclaim ran but could not destroy everything it found.
    #[error("reclaim incomplete: {0}")]
    ReclaimIncomplete(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,

    /// Invariant violation — a bug, not an operational failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CloudError> for OrchestratorError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::ProvisionerFailed(msg) | CloudError::DestroyFailed(msg) => {
                OrchestratorError::ProvisionerFailed(msg)
            }
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl OrchestratorError {
    /// Process exit code mapping: 0 success, 1 operational failure,
    /// 2 invalid invocation, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Cancelled => 130,
            OrchestratorError::ConfigInvalid(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(OrchestratorError::Cancelled.exit_code(), 130);
        assert_eq!(
            OrchestratorError::ProvisionerFailed("boom".into()).exit_code(),
            1
        );
        assert_eq!(
            OrchestratorError::Internal("bug".into()).exit_code(),
            1
        );
    }

    #[test]
    fn provisioner_cloud_errors_keep_their_kind() {
        let err: OrchestratorError =
            CloudError::ProvisionerFailed("apply exited with code 1".into()).into();
        assert!(matches!(err, OrchestratorError::ProvisionerFailed(_)));
    }
}
