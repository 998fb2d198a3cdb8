pub mod client;
pub mod control;
pub mod ec2;
pub mod error;
pub mod poll;
pub mod provisioner;

pub use client::{BaseUrls, CloudClient, StaticCredentials};
pub use control::Invocation;
pub use ec2::{GatewayInfo, InstanceInfo};
pub use error::CloudError;
pub use poll::{wait_for, Backoff, WaitError};
pub use provisioner::Provisioner;
