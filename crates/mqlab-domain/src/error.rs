use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid experiment id: {0}")]
    InvalidExperimentId(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    #[error("invalid variant kind: {0}")]
    InvalidVariantKind(String),

    #[error("invalid command status: {0}")]
    InvalidCommandStatus(String),

    #[error("invalid message size bucket: {0}")]
    InvalidSizeBucket(String),

    #[error("duplicate variant name: {0}")]
    DuplicateVariant(String),

    #[error("illegal phase transition: {from} → {to}")]
    IllegalTransition { from: String, to: String },
}
