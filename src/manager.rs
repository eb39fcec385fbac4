// src/manager.rs

use crate::config::Config;
use crate::downloader::{parse_url, Transfer, TransferError, TransferOptions};
use crate::models::{DownloadJob, JobId, JobStatus};
use crate::progress::Progress;
use crate::state_manager::{StateError, StateManager};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INTERRUPTED: &str = "interrupted by shutdown";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Why [`JobManager::retry_job_checked`] refused to start a new attempt.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RetryError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} is already in progress")]
    AlreadyActive(JobId),
    #[error("job {0} cannot be retried from status {1}")]
    NotRetriable(JobId, JobStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Transfers allowed to run at once, 0 = no cap. Jobs waiting for a slot
    /// already report `downloading`.
    pub max_concurrent: usize,
    /// How often an active job's record is written to the state store.
    pub persist_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            persist_interval_ms: 5_000,
        }
    }
}

impl ManagerConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

/// Everything the manager keeps about one job. Guarded by its own mutex so
/// transitions of one job are serialized while jobs proceed independently.
struct JobSlot {
    job: DownloadJob,
    /// Reused by every attempt; never persisted.
    headers: Vec<(String, String)>,
    /// Present while a transfer is bound to the job.
    cancel: Option<CancellationToken>,
    /// Write lock of the destination, shared by every job on the same path.
    /// The running transfer holds it for its whole lifetime, so neither a
    /// retry nor another job can write the file before the current writer has
    /// let go.
    owner: Arc<Mutex<()>>,
}

impl JobSlot {
    fn new(job: DownloadJob, headers: Vec<(String, String)>, owner: Arc<Mutex<()>>) -> Self {
        Self {
            job,
            headers,
            cancel: None,
            owner,
        }
    }
}

/// What a spawned driver needs to run one attempt.
struct Attempt {
    generation: u32,
    url: String,
    destination: PathBuf,
    headers: Vec<(String, String)>,
    cancel: CancellationToken,
    owner: Arc<Mutex<()>>,
}

struct Inner {
    transfer: Transfer,
    config: ManagerConfig,
    state: Option<StateManager>,
    jobs: Mutex<HashMap<JobId, Arc<Mutex<JobSlot>>>>,
    destinations: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    permits: Option<Arc<Semaphore>>,
}

/// Owns the download jobs and the transfers bound to them.
///
/// Cloning is cheap and every clone manages the same set of jobs. Independent
/// managers share nothing.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// A manager that keeps jobs in memory only.
    pub fn new(config: ManagerConfig, transfer: Transfer) -> Self {
        Self::build(config, transfer, None)
    }

    /// A manager that mirrors job records into `state`.
    ///
    /// Jobs stored by a previous process are loaded back. Those that were
    /// still running are marked failed; they are never resumed automatically.
    pub async fn with_state(
        config: ManagerConfig,
        transfer: Transfer,
        state: StateManager,
    ) -> Result<Self, ManagerError> {
        let manager = Self::build(config, transfer, Some(state.clone()));
        let mut loaded = 0;
        for mut job in state.load_all_jobs().await? {
            if job.status.is_active() {
                debug!(job_id = %job.id, "marking interrupted job as failed");
                job.fail(INTERRUPTED.to_string());
                state.save_job(&job).await?;
            }
            let owner = manager.destination_lock(&job.destination).await;
            let id = job.id;
            let slot = Arc::new(Mutex::new(JobSlot::new(job, Vec::new(), owner)));
            manager.inner.jobs.lock().await.insert(id, slot);
            loaded += 1;
        }
        info!(jobs = loaded, "loaded stored download jobs");

        Ok(manager)
    }

    pub async fn from_config(config: &Config) -> Result<Self, ManagerError> {
        let transfer = Transfer::new(config.transfer.clone())?;
        match &config.state_db {
            Some(path) => {
                let state = StateManager::new(path).await?;
                Self::with_state(config.manager.clone(), transfer, state).await
            }
            None => Ok(Self::new(config.manager.clone(), transfer)),
        }
    }

    fn build(
        config: ManagerConfig,
        transfer: Transfer,
        state: Option<StateManager>,
    ) -> Self {
        let permits =
            (config.max_concurrent > 0).then(|| Arc::new(Semaphore::new(config.max_concurrent)));
        Self {
            inner: Arc::new(Inner {
                transfer,
                config,
                state,
                jobs: Mutex::new(HashMap::new()),
                destinations: Mutex::new(HashMap::new()),
                permits,
            }),
        }
    }

    pub async fn create_job(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<JobId, ManagerError> {
        self.create_job_with_headers(url, destination, Vec::new()).await
    }

    /// Registers a job and starts downloading it in the background.
    ///
    /// Returns as soon as the job is `downloading`. If a partial file already
    /// sits at `destination`, the job's progress starts at its size.
    pub async fn create_job_with_headers(
        &self,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        headers: Vec<(String, String)>,
    ) -> Result<JobId, ManagerError> {
        let url = url.into();
        parse_url(&url)?;

        let mut job = DownloadJob::new(url, destination.into());
        if let Ok(meta) = tokio::fs::metadata(&job.destination).await {
            job.progress = Progress::starting_at(meta.len());
        }
        if let Some(state) = &self.inner.state {
            state.save_job(&job).await?;
        }

        let id = job.id;
        info!(job_id = %id, url = %job.url, destination = %job.destination.display(), "created download job");
        let owner = self.destination_lock(&job.destination).await;
        let slot = Arc::new(Mutex::new(JobSlot::new(job, headers, owner)));
        self.inner.jobs.lock().await.insert(id, slot.clone());

        let snapshot = {
            let mut entry = slot.lock().await;
            self.launch(&slot, &mut entry)
        };
        self.persist(&snapshot).await;
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Option<DownloadJob> {
        let slot = self.slot(id).await?;
        let job = slot.lock().await.job.clone();
        Some(job)
    }

    /// Snapshots of every job, oldest first.
    pub async fn list_jobs(&self) -> Vec<DownloadJob> {
        let slots: Vec<_> = self.inner.jobs.lock().await.values().cloned().collect();
        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.lock().await.job.clone());
        }
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Starts a new attempt for a failed or cancelled job.
    ///
    /// Returns `None` when the job is unknown, still active or completed;
    /// [`JobManager::retry_job_checked`] says which.
    pub async fn retry_job(&self, id: JobId) -> Option<DownloadJob> {
        self.retry_job_checked(id).await.ok()
    }

    pub async fn retry_job_checked(&self, id: JobId) -> Result<DownloadJob, RetryError> {
        let slot = self.slot(id).await.ok_or(RetryError::NotFound(id))?;
        let snapshot = {
            let mut entry = slot.lock().await;
            let status = entry.job.status;
            if status.is_active() {
                return Err(RetryError::AlreadyActive(id));
            }
            if !status.is_retriable() {
                return Err(RetryError::NotRetriable(id, status));
            }
            info!(job_id = %id, previous = %status, "retrying download job");
            self.launch(&slot, &mut entry)
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Stops an active job. The partial file stays on disk for a later retry.
    ///
    /// Returns false when the job is unknown or not active.
    pub async fn cancel_job(&self, id: JobId) -> bool {
        let Some(slot) = self.slot(id).await else {
            return false;
        };
        let snapshot = {
            let mut entry = slot.lock().await;
            if !entry.job.status.is_active() {
                return false;
            }
            if let Some(token) = &entry.cancel {
                token.cancel();
            }
            entry.job.cancel();
            entry.job.clone()
        };
        info!(job_id = %id, "cancelled download job");
        self.persist(&snapshot).await;
        true
    }

    /// Forgets a job that is not active. Files on disk are left alone.
    pub async fn remove_job(&self, id: JobId) -> bool {
        let destination = {
            let mut jobs = self.inner.jobs.lock().await;
            let Some(slot) = jobs.get(&id) else {
                return false;
            };
            let destination = {
                let entry = slot.lock().await;
                if entry.job.status.is_active() {
                    return false;
                }
                entry.job.destination.clone()
            };
            jobs.remove(&id);
            destination
        };
        self.release_destination(&destination).await;
        if let Some(state) = &self.inner.state {
            if let Err(e) = state.delete_job(id).await {
                warn!(job_id = %id, error = %e, "failed to delete stored job");
            }
        }
        debug!(job_id = %id, "removed download job");
        true
    }

    /// Cancels every active job and waits until all transfers have stopped.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.inner.jobs.lock().await.values().cloned().collect();
        let mut owners = Vec::with_capacity(slots.len());
        for slot in slots {
            let snapshot = {
                let mut entry = slot.lock().await;
                owners.push(entry.owner.clone());
                if !entry.job.status.is_active() {
                    continue;
                }
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                entry.job.cancel();
                entry.job.clone()
            };
            self.persist(&snapshot).await;
        }
        for owner in owners {
            let _released = owner.lock().await;
        }
        info!("download manager shut down");
    }

    /// The write lock shared by all jobs targeting `destination`.
    async fn destination_lock(&self, destination: &Path) -> Arc<Mutex<()>> {
        let key = destination_key(destination).await;
        self.inner
            .destinations
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock for `destination` once no job or transfer refers to it.
    async fn release_destination(&self, destination: &Path) {
        let key = destination_key(destination).await;
        let mut destinations = self.inner.destinations.lock().await;
        if destinations
            .get(&key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            destinations.remove(&key);
        }
    }

    async fn slot(&self, id: JobId) -> Option<Arc<Mutex<JobSlot>>> {
        self.inner.jobs.lock().await.get(&id).cloned()
    }

    /// Moves the job to `downloading` and spawns its driver. The caller holds
    /// the slot lock, which makes check-then-start atomic per job.
    fn launch(&self, slot: &Arc<Mutex<JobSlot>>, entry: &mut JobSlot) -> DownloadJob {
        let cancel = CancellationToken::new();
        entry.job.begin_attempt();
        entry.cancel = Some(cancel.clone());

        let attempt = Attempt {
            generation: entry.job.attempts,
            url: entry.job.url.clone(),
            destination: entry.job.destination.clone(),
            headers: entry.headers.clone(),
            cancel,
            owner: entry.owner.clone(),
        };
        tokio::spawn(self.clone().drive(slot.clone(), attempt));

        entry.job.clone()
    }

    async fn drive(self, slot: Arc<Mutex<JobSlot>>, attempt: Attempt) {
        // Another job or an earlier attempt may still be writing the file.
        let _owner = tokio::select! {
            _ = attempt.cancel.cancelled() => {
                self.finish(&slot, attempt.generation, Err(TransferError::Cancelled)).await;
                return;
            }
            owner = attempt.owner.clone().lock_owned() => owner,
        };

        let permit = match &self.inner.permits {
            None => None,
            Some(permits) => tokio::select! {
                _ = attempt.cancel.cancelled() => {
                    self.finish(&slot, attempt.generation, Err(TransferError::Cancelled)).await;
                    return;
                }
                permit = permits.clone().acquire_owned() => permit.ok(),
            },
        };

        let result = self.run_transfer(&slot, &attempt).await;
        drop(permit);
        self.finish(&slot, attempt.generation, result).await;
    }

    /// Runs the transfer, folding its progress samples into the job record.
    async fn run_transfer(
        &self,
        slot: &Arc<Mutex<JobSlot>>,
        attempt: &Attempt,
    ) -> Result<(), TransferError> {
        let (progress_tx, mut progress_rx) = watch::channel(None::<Progress>);
        let options = TransferOptions::new()
            .headers(attempt.headers.clone())
            .cancel_token(attempt.cancel.clone())
            .on_progress(move |progress| {
                progress_tx.send_replace(Some(progress));
            });

        let fetch = self
            .inner
            .transfer
            .fetch(&attempt.url, &attempt.destination, options);
        tokio::pin!(fetch);

        let period = self.inner.config.persist_interval();
        let mut persist = tokio::time::interval_at(Instant::now() + period, period);
        let persisting = self.inner.state.is_some();

        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                Ok(()) = progress_rx.changed() => {
                    let latest = *progress_rx.borrow_and_update();
                    if let Some(progress) = latest {
                        self.apply_progress(slot, attempt.generation, progress).await;
                    }
                }
                _ = persist.tick(), if persisting => {
                    let snapshot = slot.lock().await.job.clone();
                    if snapshot.attempts == attempt.generation {
                        self.persist(&snapshot).await;
                    }
                }
            }
        };

        // The last sample can land in the same poll that completed the fetch.
        let latest = *progress_rx.borrow();
        if let Some(progress) = latest {
            self.apply_progress(slot, attempt.generation, progress).await;
        }
        result
    }

    async fn apply_progress(&self, slot: &Arc<Mutex<JobSlot>>, generation: u32, progress: Progress) {
        let mut entry = slot.lock().await;
        if entry.job.attempts == generation {
            entry.job.apply_progress(progress);
        }
    }

    async fn finish(
        &self,
        slot: &Arc<Mutex<JobSlot>>,
        generation: u32,
        result: Result<(), TransferError>,
    ) {
        let snapshot = {
            let mut entry = slot.lock().await;
            if entry.job.attempts != generation {
                // A newer attempt owns the record now.
                return;
            }
            entry.cancel = None;
            let id = entry.job.id;

            match result {
                _ if entry.job.status == JobStatus::Cancelled => {
                    info!(job_id = %id, downloaded = entry.job.progress.downloaded, "download stopped after cancel");
                }
                Ok(()) => {
                    entry.job.complete();
                    info!(job_id = %id, bytes = entry.job.progress.downloaded, "download completed");
                }
                Err(TransferError::Cancelled) => {
                    entry.job.cancel();
                    info!(job_id = %id, "download cancelled");
                }
                Err(err) => {
                    warn!(job_id = %id, error = %err, "download failed");
                    entry.job.fail(describe(&err));
                }
            }
            entry.job.clone()
        };
        self.persist(&snapshot).await;
    }

    async fn persist(&self, job: &DownloadJob) {
        if let Some(state) = &self.inner.state {
            if let Err(e) = state.save_job(job).await {
                warn!(job_id = %job.id, error = %e, "failed to save download job");
            }
        }
    }
}

/// Identifies a destination regardless of how its path was spelled. Only the
/// parent is canonicalized since the file itself may not exist yet.
async fn destination_key(destination: &Path) -> PathBuf {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (tokio::fs::canonicalize(parent).await, destination.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ if destination.is_relative() => match std::env::current_dir() {
            Ok(cwd) => cwd.join(destination),
            Err(_) => destination.to_path_buf(),
        },
        _ => destination.to_path_buf(),
    }
}

/// Human-facing failure text; HTTP errors keep the start of the response body.
fn describe(err: &TransferError) -> String {
    match err {
        TransferError::Http { body, .. } if !body.trim().is_empty() => {
            format!("{err}: {}", body.trim())
        }
        _ => err.to_string(),
    }
}
