// src/models.rs

use crate::progress::Progress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle of a download job.
///
/// `pending -> downloading -> completed | failed | cancelled`; `failed` and
/// `cancelled` go back to `downloading` on retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// A transfer is (or is about to be) running.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Downloading)
    }

    pub fn is_retriable(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record callers see. Request headers are deliberately not part of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: JobId,
    pub status: JobStatus,
    pub url: String,
    pub destination: PathBuf,
    pub progress: Progress,
    /// Set only while `status` is `failed`.
    pub error: Option<String>,
    /// Transfers started for this job, including the first.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadJob {
    pub fn new(url: String, destination: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            url,
            destination,
            progress: Progress::default(),
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves into `downloading` for a new attempt.
    pub(crate) fn begin_attempt(&mut self) {
        self.status = JobStatus::Downloading;
        self.error = None;
        self.attempts += 1;
        self.touch();
    }

    pub(crate) fn apply_progress(&mut self, progress: Progress) {
        self.progress = progress;
        self.touch();
    }

    pub(crate) fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.error = None;
        self.touch();
    }

    pub(crate) fn fail(&mut self, reason: String) {
        self.status = JobStatus::Failed;
        self.error = Some(reason);
        self.touch();
    }

    pub(crate) fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.error = None;
        self.touch();
    }
}
