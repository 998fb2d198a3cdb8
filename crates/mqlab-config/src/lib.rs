mod raw;
mod loader;
pub mod error;
pub mod merge;

pub use error::ConfigError;
pub use loader::{load_infra, load_test_plan, InfraConfig, RoleSpec, RolesSpec, StorageSpec};
pub use merge::{merge_workload, render_artefact};
