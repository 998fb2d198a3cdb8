pub mod context;
pub mod error;
pub mod matrix;
pub mod probe;
pub mod report;
pub mod sampler;
pub mod sequencer;

pub use context::ExperimentContext;
pub use error::OrchestratorError;
pub use matrix::{BenchSummary, MatrixRunner, VariantRecord};
pub use probe::Prober;
pub use report::ReportDoc;
pub use sampler::Sampler;
pub use sequencer::Sequencer;
