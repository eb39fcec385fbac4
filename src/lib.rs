//! Resumable downloads of large model files, with a job manager on top.
//!
//! [`downloader::Transfer`] fetches one URL to one file: it follows redirects,
//! resumes with range requests, detects stalls and retries transient
//! failures. [`manager::JobManager`] wraps transfers into jobs that can be
//! queried, cancelled and retried by id.

pub mod config;
pub mod downloader;
pub mod humanize;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod progress;
pub mod state_manager;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::downloader::{Transfer, TransferConfig, TransferError, TransferOptions};
    pub use crate::manager::{JobManager, ManagerConfig, ManagerError, RetryError};
    pub use crate::models::{DownloadJob, JobId, JobStatus};
    pub use crate::progress::Progress;
    pub use crate::state_manager::StateManager;
}
