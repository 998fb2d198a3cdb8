pub mod error;
pub mod matrix;
pub mod types;


pub use error::DomainError;
pub use matrix::{
    MessageSize, PlateauPolicy, TestMatrix, TestVariant, VariantKind, VariantOutcome, Workload,
};
pub use types::{
    required_tags, CommandResult, CommandStatus, ExperimentId, Fleet, HealthProbe, HealthSnapshot,
    Host, Phase, Role, ServiceDescriptor, TagMap, BENCHMARK_BIN, TAG_COMPONENT, TAG_EXPERIMENT_ID,
    TAG_MANAGED_BY, TAG_PROJECT,
};
