use std::time::Duration;

use mqlab_domain::CommandStatus;
use mqlab_cloud::CloudError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("command on {host} ended {kind}: {stderr}")]
    ExecutionFailed {
        host: String,
        kind: CommandStatus,
        stderr: String,
    },

    #[error("command on {host} exceeded its deadline of {deadline:?}")]
    DeadlineExceeded { host: String, deadline: Duration },

    #[error("command on {host} cancelled")]
    Cancelled { host: String },

    #[error("could not decode downloaded file {path}: {message}")]
    Decode { path: String, message: String },
}
