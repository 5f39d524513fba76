//! Row store and job supervisor contracts, their in-memory and Postgres
//! implementations, per-scope writer locks and outbound HTTP plumbing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mirror_core::{
    Filter, JobId, JobState, JobStatus, Row, Scope, SyncError, SyncJob, CHECKPOINT_STATE_PREFIX,
};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub mod http;
pub mod postgres;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RateLimit};
pub use postgres::{PgJobSupervisor, PgRowStore};

pub const CRATE_NAME: &str = "mirror-storage";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Keyed record storage consumed by the sync core.
///
/// `resource` names the mirror table (one per integration resource type).
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, resource: &str, filter: &Filter) -> Result<Vec<Row>, SyncError>;

    /// Inserts rows whose `match_key` value is unknown, replaces the rest wholesale.
    async fn upsert(
        &self,
        resource: &str,
        rows: Vec<Row>,
        match_key: &str,
    ) -> Result<UpsertCounts, SyncError>;

    async fn delete(&self, resource: &str, filter: &Filter) -> Result<u64, SyncError>;

    async fn count(&self, resource: &str, filter: &Filter) -> Result<u64, SyncError> {
        Ok(self.select(resource, filter).await?.len() as u64)
    }
}

/// Job lifecycle owner: creates jobs, hands them to exactly one run, records
/// the terminal outcome.
#[async_trait]
pub trait JobSupervisor: Send + Sync {
    /// Creates a queued job. Checkpoint keys of the scope's previous job are
    /// carried into the new job's state so an interrupted walk resumes.
    async fn create_job(&self, scope: &Scope) -> Result<SyncJob, SyncError>;

    async fn load_job(&self, id: JobId) -> Result<SyncJob, SyncError>;

    /// Moves a queued job to running. A job is consumed at most once.
    async fn begin_job(&self, id: JobId) -> Result<SyncJob, SyncError>;

    /// Records the terminal status together with the flushed job state.
    async fn mark_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), SyncError>;

    /// The most recently started job for `scope`, whatever its status.
    async fn latest_started_job(&self, scope: &Scope) -> Result<Option<SyncJob>, SyncError>;

    /// Jobs for `scope`, newest first.
    async fn list_jobs(&self, scope: &Scope, limit: usize) -> Result<Vec<SyncJob>, SyncError>;
}

/// Keeps only the checkpoint entries of a previous job's state.
pub fn carried_checkpoints(previous: &JobState) -> JobState {
    previous
        .iter()
        .filter(|(key, _)| key.starts_with(CHECKPOINT_STATE_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn match_value<'a>(row: &'a Row, match_key: &str) -> Result<&'a Value, SyncError> {
    match row.get(match_key) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(SyncError::storage(
            "upserting rows",
            format!("row is missing match key `{match_key}`"),
        )),
    }
}

#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds rows directly, bypassing upsert semantics.
    pub async fn insert_raw(&self, resource: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.lock().await;
        tables.entry(resource.to_string()).or_default().extend(rows);
    }

    pub async fn all(&self, resource: &str) -> Vec<Row> {
        let tables = self.tables.lock().await;
        tables.get(resource).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn select(&self, resource: &str, filter: &Filter) -> Result<Vec<Row>, SyncError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(resource)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        resource: &str,
        rows: Vec<Row>,
        match_key: &str,
    ) -> Result<UpsertCounts, SyncError> {
        for row in &rows {
            match_value(row, match_key)?;
        }

        let mut tables = self.tables.lock().await;
        let table = tables.entry(resource.to_string()).or_default();
        let mut counts = UpsertCounts::default();
        for row in rows {
            let key = match_value(&row, match_key)?.clone();
            match table.iter_mut().find(|existing| existing.get(match_key) == Some(&key)) {
                Some(existing) => {
                    *existing = row;
                    counts.updated += 1;
                }
                None => {
                    table.push(row);
                    counts.inserted += 1;
                }
            }
        }
        debug!(resource, inserted = counts.inserted, updated = counts.updated, "memory upsert");
        Ok(counts)
    }

    async fn delete(&self, resource: &str, filter: &Filter) -> Result<u64, SyncError> {
        let mut tables = self.tables.lock().await;
        let Some(table) = tables.get_mut(resource) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|row| !filter.matches(row));
        Ok((before - table.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobSupervisor {
    jobs: Mutex<Vec<SyncJob>>,
}

impl MemoryJobSupervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobSupervisor for MemoryJobSupervisor {
    async fn create_job(&self, scope: &Scope) -> Result<SyncJob, SyncError> {
        let mut jobs = self.jobs.lock().await;
        let state = jobs
            .iter()
            .rev()
            .find(|job| &job.scope == scope)
            .map(|previous| carried_checkpoints(&previous.state))
            .unwrap_or_default();
        let job = SyncJob::new_queued(scope.clone(), state, Utc::now());
        jobs.push(job.clone());
        Ok(job)
    }

    async fn load_job(&self, id: JobId) -> Result<SyncJob, SyncError> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .find(|job| job.id == id)
            .cloned()
            .ok_or(SyncError::JobNotFound(id))
    }

    async fn begin_job(&self, id: JobId) -> Result<SyncJob, SyncError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(SyncError::JobNotFound(id))?;
        if job.status != JobStatus::Queued {
            return Err(SyncError::JobState {
                id,
                from: job.status,
                to: JobStatus::Running,
            });
        }
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn mark_job_status(
        &self,
        id: JobId,
        status: JobStatus,
        state: JobState,
        error: Option<String>,
    ) -> Result<(), SyncError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(SyncError::JobNotFound(id))?;
        if !status.is_terminal() || job.status != JobStatus::Running {
            return Err(SyncError::JobState {
                id,
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        job.state = state;
        job.error = error;
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn latest_started_job(&self, scope: &Scope) -> Result<Option<SyncJob>, SyncError> {
        let jobs = self.jobs.lock().await;
        // Ties on started_at resolve to the later-created job.
        Ok(jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| &job.scope == scope && job.started_at.is_some())
            .max_by_key(|(idx, job)| (job.started_at, *idx))
            .map(|(_, job)| job.clone()))
    }

    async fn list_jobs(&self, scope: &Scope, limit: usize) -> Result<Vec<SyncJob>, SyncError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .rev()
            .filter(|job| &job.scope == scope)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Guard proving this process is the only writer for a scope.
#[derive(Debug)]
pub struct ScopeGuard {
    scope_key: String,
    _permit: OwnedSemaphorePermit,
}

impl ScopeGuard {
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }
}

/// At-most-one-writer bookkeeping, one single-permit semaphore per scope.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    scopes: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the scope without waiting; a held scope is `ScopeBusy`.
    ///
    /// The permit is taken under the map lock, so semaphores nobody holds can
    /// be evicted here and the map stays as small as the set of running scopes.
    pub async fn try_lock(&self, scope: &Scope) -> Result<ScopeGuard, SyncError> {
        let scope_key = scope.key();
        let mut scopes = self.scopes.lock().await;
        scopes.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        let semaphore = Arc::clone(
            scopes
                .entry(scope_key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        );
        let permit = semaphore
            .try_acquire_owned()
            .map_err(|_| SyncError::ScopeBusy(scope_key.clone()))?;
        Ok(ScopeGuard {
            scope_key,
            _permit: permit,
        })
    }
}
