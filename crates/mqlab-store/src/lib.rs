pub mod error;
pub mod experiment;
pub mod log;

pub use error::StoreError;
pub use experiment::{ExperimentDir, ExperimentStore, ExperimentSummary};
pub use log::ExperimentLog;
