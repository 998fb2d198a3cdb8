use mqlab_cloud::CloudError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReclaimError {
    /// A tag enumeration kept failing; without discovery there is nothing
    /// to destroy, so this surfaces instead of silently reporting clean.
    #[error("resource discovery failed for {kind}: {source}")]
    Discovery {
        kind: &'static str,
        #[source]
        source: CloudError,
    },
}
