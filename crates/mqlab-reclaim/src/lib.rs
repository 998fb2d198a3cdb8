pub mod error;
pub mod reclaim;

pub use error::ReclaimError;
pub use reclaim::{ReclaimPlan, ReclaimReport, Reclaimer};
