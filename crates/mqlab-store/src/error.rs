use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("no experiment recorded as latest")]
    NoLatest,

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("domain error: {0}")]
    Domain(#[from] mqlab_domain::DomainError),
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
