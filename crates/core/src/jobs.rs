//! In-memory job records. Jobs are scoped to the browser session that
//! created them and never survive a process restart.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

/// Mutable job record held by the registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub status: JobStatus,
    /// 0.0 to 100.0, never decreasing.
    pub progress: f32,
    pub total_frames: u64,
    pub processed_frames: u64,
    /// Whole seconds, recomputed per frame during download.
    pub estimated_time_remaining: Option<u64>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancel_token: CancellationToken,
}

/// What clients see, over both the REST status endpoint and the
/// progress WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: f32,
    pub total_frames: u64,
    pub processed_frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            total_frames: job.total_frames,
            processed_frames: job.processed_frames,
            estimated_time_remaining: job.estimated_time_remaining,
            error: job.error.clone(),
            created_at: job.created_at,
        }
    }
}

/// Concurrent map of live and finished jobs, keyed by job ID.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session_id: &str, total_frames: u64) -> Job {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            total_frames,
            processed_frames: 0,
            estimated_time_remaining: None,
            output_path: None,
            error: None,
            created_at: Utc::now(),
            cancel_token: CancellationToken::new(),
        };
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// Snapshot of a job, only if it belongs to `session_id`.
    pub fn get(&self, job_id: &str, session_id: &str) -> Option<JobSnapshot> {
        self.jobs
            .get(job_id)
            .filter(|job| job.session_id == session_id)
            .map(|job| JobSnapshot::from(&*job))
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs.get(job_id).map(|job| JobSnapshot::from(&*job))
    }

    pub fn output_path(&self, job_id: &str, session_id: &str) -> Option<PathBuf> {
        self.jobs
            .get(job_id)
            .filter(|job| job.session_id == session_id)
            .and_then(|job| job.output_path.clone())
    }

    pub fn list_by_session(&self, session_id: &str) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| JobSnapshot::from(&*entry))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    /// Mutate a job and return the resulting snapshot. Progress is kept
    /// monotonic regardless of what the closure writes.
    pub fn update<F>(&self, job_id: &str, f: F) -> Option<JobSnapshot>
    where
        F: FnOnce(&mut Job),
    {
        let mut entry = self.jobs.get_mut(job_id)?;
        let previous = entry.progress;
        f(&mut entry);
        if entry.progress < previous {
            entry.progress = previous;
        }
        Some(JobSnapshot::from(&*entry))
    }

    /// Remove a job owned by `session_id`, cancelling it first so any
    /// running ffmpeg child is killed. Returns the removed record.
    pub fn remove(&self, job_id: &str, session_id: &str) -> Option<Job> {
        let owned = self
            .jobs
            .get(job_id)
            .is_some_and(|job| job.session_id == session_id);
        if !owned {
            return None;
        }
        let (_, job) = self.jobs.remove(job_id)?;
        job.cancel_token.cancel();
        Some(job)
    }

    /// Drop finished jobs whose output artifact no longer exists on
    /// disk. Called by the artifact reaper after sweeping files.
    pub fn prune_missing_outputs(&self) {
        self.jobs.retain(|_, job| {
            if job.status != JobStatus::Completed {
                return true;
            }
            match &job.output_path {
                Some(path) => path.exists(),
                None => false,
            }
        });
    }

    pub fn cancel_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.jobs.get(job_id).map(|job| job.cancel_token.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
