//! Sync orchestration: the step chain, checkpointed pagination, reconciliation
//! and prune, the generic runner and the connector registry that feeds it.

pub mod checkpoint;
pub mod config;
pub mod hooks;
pub mod pipeline;
pub mod reconcile;
pub mod runner;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use mirror_core::{JobId, Scope, SyncError, SyncJob};
use mirror_storage::{HttpFetcher, PgJobSupervisor, PgRowStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub use checkpoint::{paginate, CheckpointState, PageSink, PaginationLimits, WalkSummary};
pub use config::{ConnectorConfig, ConnectorRegistry, ConnectorTarget, SyncConfig};
pub use hooks::{FinalizeHook, RowCountMetrics};
pub use pipeline::{FinalizedChain, PipelineContext, SyncChain};
pub use reconcile::{prune, reconcile};
pub use runner::{ResourceReport, RunOptions, SyncReport, SyncRunner};

pub const CRATE_NAME: &str = "mirror-sync";

/// Result of one connector's run inside a sweep.
#[derive(Debug)]
pub struct TargetOutcome {
    pub source_id: String,
    pub scope: Scope,
    pub result: Result<SyncReport, SyncError>,
}

/// Every enabled connector wired to a runner.
pub struct SyncService {
    config: SyncConfig,
    runner: SyncRunner,
    targets: Vec<ConnectorTarget>,
}

pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

impl SyncService {
    pub fn new(config: SyncConfig, runner: SyncRunner, targets: Vec<ConnectorTarget>) -> Self {
        Self {
            config,
            runner,
            targets,
        }
    }

    /// Postgres-backed service built from the environment and the connector registry.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let pool = connect_pool(&config.database_url).await?;
        let registry = ConnectorRegistry::load(&config.connectors_path).await?;
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config()?).context("building http client")?,
        );
        let base_dir = config
            .connectors_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let targets = registry.build_targets(&base_dir, &http)?;

        let runner = SyncRunner::new(
            Arc::new(PgRowStore::new(pool.clone())),
            Arc::new(PgJobSupervisor::new(pool)),
        )
        .with_options(config.run_options())
        .with_hook(Arc::new(RowCountMetrics));
        Ok(Self::new(config, runner, targets))
    }

    pub fn targets(&self) -> &[ConnectorTarget] {
        &self.targets
    }

    pub fn runner(&self) -> &SyncRunner {
        &self.runner
    }

    /// Runs one job per selected connector; different scopes run concurrently.
    pub async fn run_once(&self, source_id: Option<&str>) -> Result<Vec<TargetOutcome>> {
        let selected: Vec<&ConnectorTarget> = self
            .targets
            .iter()
            .filter(|t| source_id.map_or(true, |id| t.integration.source_id == id))
            .collect();
        if let Some(id) = source_id {
            if selected.is_empty() {
                anyhow::bail!("no enabled connector named {id}");
            }
        }

        let runs = selected.into_iter().map(|target| async move {
            let result = self.runner.sync(&target.integration, &target.scope).await;
            match &result {
                Ok(report) => info!(
                    source_id = %target.integration.source_id,
                    job_id = %report.job_id,
                    resources = report.resources.len(),
                    "connector synced"
                ),
                Err(err) => warn!(
                    source_id = %target.integration.source_id,
                    kind = err.kind(),
                    error = %err,
                    "connector sync failed"
                ),
            }
            TargetOutcome {
                source_id: target.integration.source_id.clone(),
                scope: target.scope.clone(),
                result,
            }
        });
        Ok(join_all(runs).await)
    }

    /// Runs an already-queued job for whichever connector owns its scope.
    pub async fn run_queued(&self, job_id: JobId) -> Result<SyncReport> {
        let job = self.runner.supervisor().load_job(job_id).await?;
        let target = self
            .targets
            .iter()
            .find(|t| t.scope == job.scope)
            .with_context(|| format!("no enabled connector for scope {}", job.scope))?;
        Ok(self.runner.run_job(&target.integration, job_id).await?)
    }

    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<SyncJob>> {
        let mut jobs = Vec::new();
        for target in &self.targets {
            jobs.extend(self.runner.supervisor().list_jobs(&target.scope, limit).await?);
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let service = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.run_once(None).await {
                    Ok(outcomes) => {
                        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
                        info!(connectors = outcomes.len(), failed, "scheduled sync finished");
                    }
                    Err(err) => error!(error = %err, "scheduled sync could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_adapters::{
        FieldMapTransform, FieldMapping, FixtureAdapter, Integration, ResourceBinding, ResourceSchema,
    };
    use mirror_core::JobStatus;
    use mirror_storage::{MemoryJobSupervisor, MemoryRowStore};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn target(source_id: &str, tenant: &str, pages: Vec<Vec<serde_json::Value>>) -> ConnectorTarget {
        ConnectorTarget {
            integration: Integration {
                source_id: source_id.into(),
                display_name: source_id.into(),
                resources: vec![ResourceBinding {
                    schema: ResourceSchema::new("devices", "mirror_devices"),
                    adapter: Arc::new(FixtureAdapter::from_pages("devices", pages)),
                    transform: Arc::new(FieldMapTransform::new(FieldMapping {
                        external_id: "/id".into(),
                        fields: BTreeMap::new(),
                        required: Vec::new(),
                        keep_raw: true,
                    })),
                }],
            },
            scope: Scope::new(tenant, source_id, None),
        }
    }

    fn service(targets: Vec<ConnectorTarget>, store: Arc<MemoryRowStore>) -> SyncService {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        let runner = SyncRunner::new(store, Arc::new(MemoryJobSupervisor::new()));
        SyncService::new(config, runner, targets)
    }

    #[tokio::test]
    async fn sweep_runs_every_scope_and_isolates_failures() {
        let store = Arc::new(MemoryRowStore::new());
        let svc = service(
            vec![
                target("edr", "acme", vec![vec![json!({ "id": "d1" }), json!({ "id": "d2" })]]),
                target("edr", "globex", vec![vec![json!({ "id": "d1" })]]),
                target("mdm", "acme", vec![vec![json!({ "name": "no id" })]]),
            ],
            store.clone(),
        );

        let outcomes = svc.run_once(None).await.expect("sweep");
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_ok());
        assert!(matches!(outcomes[2].result, Err(SyncError::Transform { .. })));
        assert_eq!(store.all("mirror_devices").await.len(), 3);

        let jobs = svc.recent_jobs(5).await.expect("jobs");
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::Failed).count(), 1);
    }

    #[tokio::test]
    async fn sweep_can_target_one_connector() {
        let store = Arc::new(MemoryRowStore::new());
        let svc = service(
            vec![
                target("edr", "acme", vec![vec![json!({ "id": "d1" })]]),
                target("mdm", "acme", vec![vec![json!({ "id": "m1" })]]),
            ],
            store.clone(),
        );

        let outcomes = svc.run_once(Some("mdm")).await.expect("sweep");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].source_id, "mdm");
        assert!(svc.run_once(Some("crm")).await.is_err());
    }

    #[tokio::test]
    async fn queued_jobs_run_through_their_connector() {
        let store = Arc::new(MemoryRowStore::new());
        let svc = service(
            vec![target("edr", "acme", vec![vec![json!({ "id": "d1" })]])],
            store.clone(),
        );
        let job = svc
            .runner()
            .enqueue(&Scope::new("acme", "edr", None))
            .await
            .expect("enqueue");

        let report = svc.run_queued(job.id).await.expect("run");
        assert_eq!(report.job_id, job.id);
        assert_eq!(report.resources[0].inserted, 1);

        let orphan = svc
            .runner()
            .enqueue(&Scope::new("acme", "crm", None))
            .await
            .expect("enqueue");
        assert!(svc.run_queued(orphan.id).await.is_err());
    }
}
