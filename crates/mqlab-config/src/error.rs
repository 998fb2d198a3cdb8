use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("unknown workload key '{0}' in overrides")]
    UnknownWorkloadKey(String),

    #[error("workload merge failed: {0}")]
    Merge(String),

    #[error("domain error: {0}")]
    Domain(#[from] mqlab_domain::DomainError),
}
