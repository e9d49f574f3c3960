pub mod auth;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod output;
pub mod worker;

pub use error::{ErrorCode, Result, WorkerError};
pub use manager::JobManager;
