// src/state_manager.rs

use crate::models::{DownloadJob, JobId};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stores job records as JSON rows in SQLite.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Opens (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS download_jobs (
                        id          TEXT PRIMARY KEY,
                        created_at  TEXT NOT NULL,
                        job_data    TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces the record for `job.id`.
    pub async fn save_job(&self, job: &DownloadJob) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let id = job.id.to_string();
        let created_at = job.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO download_jobs (id, created_at, job_data)
                     VALUES (?1, ?2, ?3)",
                    params![id, created_at, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All stored jobs, oldest first.
    pub async fn load_all_jobs(&self) -> Result<Vec<DownloadJob>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT job_data FROM download_jobs ORDER BY created_at")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<String>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StateError::from))
            .collect()
    }

    pub async fn delete_job(&self, id: JobId) -> Result<(), StateError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM download_jobs WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    #[tokio::test]
    async fn save_load_delete() {
        let state = StateManager::in_memory().await.unwrap();
        let mut first = DownloadJob::new("https://example.com/a.bin".into(), "a.bin".into());
        let second = DownloadJob::new("https://example.com/b.bin".into(), "b.bin".into());
        state.save_job(&first).await.unwrap();
        state.save_job(&second).await.unwrap();

        first.fail("HTTP 503 for https://example.com/a.bin".into());
        state.save_job(&first).await.unwrap();

        let jobs = state.load_all_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        let stored = jobs.iter().find(|j| j.id == first.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error, first.error);

        state.delete_job(first.id).await.unwrap();
        let jobs = state.load_all_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, second.id);
    }

    #[tokio::test]
    async fn reopens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job = DownloadJob::new("https://example.com/a.bin".into(), "a.bin".into());
        {
            let state = StateManager::new(&path).await.unwrap();
            state.save_job(&job).await.unwrap();
        }

        let state = StateManager::new(&path).await.unwrap();
        let jobs = state.load_all_jobs().await.unwrap();
        assert_eq!(jobs, vec![job]);
    }
}
