//! One generic mirror → prune chain, driven by the resource bindings of any
//! integration. Each fetched page is transformed and reconciled before the
//! walk checkpoints past it; the prune waits for the whole run to succeed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mirror_adapters::{dedupe_by_external_id, transform_all, Integration, ResourceBinding, ResourceSchema};
use mirror_core::{CanonicalRow, Filter, JobId, Row, Scope, SyncError, SyncJob, EXTERNAL_ID_KEY};
use mirror_storage::{JobSupervisor, RowStore, ScopeLocks, UpsertCounts};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::checkpoint::{paginate, PageSink, PaginationLimits};
use crate::hooks::FinalizeHook;
use crate::pipeline::{PipelineContext, SyncChain, DEFAULT_STEP_TIMEOUT};
use crate::reconcile::{prune, reconcile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    pub resource: String,
    pub table: String,
    pub pages: u64,
    pub fetched: usize,
    pub resumed: bool,
    pub inserted: u64,
    pub updated: u64,
    /// `None` when the prune was skipped for this run.
    pub pruned: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub job_id: JobId,
    pub scope: Scope,
    pub resources: Vec<ResourceReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub step_timeout: Duration,
    pub pagination: PaginationLimits,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            pagination: PaginationLimits::default(),
        }
    }
}

fn to_stored_row(row: CanonicalRow, schema: &ResourceSchema) -> Result<Row, SyncError> {
    let shadowed = [schema.external_id_key.as_str(), schema.internal_id_key.as_str()]
        .into_iter()
        .find(|key| row.fields.contains_key(*key));
    if let Some(key) = shadowed {
        return Err(SyncError::transform(
            &schema.name,
            format!("domain field `{key}` collides with a reserved column"),
        ));
    }
    let mut row = row.into_row().map_err(|err| match err {
        SyncError::Transform { message, .. } => SyncError::transform(&schema.name, message),
        other => other,
    })?;
    if schema.external_id_key != EXTERNAL_ID_KEY {
        if let Some(external_id) = row.remove(EXTERNAL_ID_KEY) {
            row.insert(schema.external_id_key.clone(), external_id);
        }
    }
    Ok(row)
}

/// Transforms and reconciles each page of one resource as it arrives.
struct MirrorWriter<'a> {
    ctx: &'a PipelineContext,
    binding: &'a ResourceBinding,
    store: &'a dyn RowStore,
    scope_filter: Filter,
    page: u64,
    counts: UpsertCounts,
}

#[async_trait]
impl PageSink for MirrorWriter<'_> {
    async fn write_page(&mut self, items: Vec<Value>) -> Result<(), SyncError> {
        let schema = &self.binding.schema;
        self.page += 1;
        let canonical = transform_all(self.binding.transform.as_ref(), self.ctx.scope(), &items)
            .map_err(|err| SyncError::transform(&schema.name, format!("page {}: {err}", self.page)))?;
        let rows = dedupe_by_external_id(&schema.name, canonical)
            .into_iter()
            .map(|row| to_stored_row(row, schema))
            .collect::<Result<Vec<_>, _>>()?;
        let counts = reconcile(
            self.store,
            &schema.table,
            &self.scope_filter,
            rows,
            &schema.external_id_key,
            &schema.internal_id_key,
            self.ctx.job_id(),
        )
        .await?;
        debug!(
            resource = %schema.name,
            page = self.page,
            inserted = counts.inserted,
            updated = counts.updated,
            "page mirrored"
        );
        self.counts.inserted += counts.inserted;
        self.counts.updated += counts.updated;
        Ok(())
    }
}

async fn mirror_resource(
    ctx: &PipelineContext,
    binding: &ResourceBinding,
    store: &dyn RowStore,
    limits: PaginationLimits,
) -> Result<ResourceReport, SyncError> {
    let schema = &binding.schema;
    let mut writer = MirrorWriter {
        ctx,
        binding,
        store,
        scope_filter: ctx.scope().filter(),
        page: 0,
        counts: UpsertCounts::default(),
    };
    let walk = paginate(ctx, binding.adapter.as_ref(), &schema.name, limits, &mut writer).await?;
    Ok(ResourceReport {
        resource: schema.name.clone(),
        table: schema.table.clone(),
        pages: walk.pages,
        fetched: walk.items,
        resumed: walk.resumed,
        inserted: writer.counts.inserted,
        updated: writer.counts.updated,
        pruned: None,
    })
}

/// Runs sync jobs for integrations against one row store and job supervisor.
pub struct SyncRunner {
    store: Arc<dyn RowStore>,
    supervisor: Arc<dyn JobSupervisor>,
    locks: Arc<ScopeLocks>,
    hooks: Vec<Arc<dyn FinalizeHook>>,
    options: RunOptions,
}

impl SyncRunner {
    pub fn new(store: Arc<dyn RowStore>, supervisor: Arc<dyn JobSupervisor>) -> Self {
        Self {
            store,
            supervisor,
            locks: Arc::new(ScopeLocks::new()),
            hooks: Vec::new(),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn FinalizeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn locks(&self) -> &Arc<ScopeLocks> {
        &self.locks
    }

    pub fn supervisor(&self) -> &Arc<dyn JobSupervisor> {
        &self.supervisor
    }

    pub async fn enqueue(&self, scope: &Scope) -> Result<SyncJob, SyncError> {
        self.supervisor.create_job(scope).await
    }

    /// Creates a job for `scope` and runs it.
    pub async fn sync(&self, integration: &Integration, scope: &Scope) -> Result<SyncReport, SyncError> {
        let job = self.enqueue(scope).await?;
        self.run_job(integration, job.id).await
    }

    /// Runs a queued job. A busy scope returns `ScopeBusy` and leaves the job queued.
    pub async fn run_job(&self, integration: &Integration, job_id: JobId) -> Result<SyncReport, SyncError> {
        let job = self.supervisor.load_job(job_id).await?;
        if job.scope.source_id != integration.source_id {
            return Err(SyncError::Config(format!(
                "job {job_id} belongs to source {}, not {}",
                job.scope.source_id, integration.source_id
            )));
        }

        let _guard = self.locks.try_lock(&job.scope).await?;
        let job = self.supervisor.begin_job(job_id).await?;
        let span = info_span!("sync_job", %job_id, scope = %job.scope);
        self.run_chain(integration, job).instrument(span).await
    }

    async fn run_chain(&self, integration: &Integration, job: SyncJob) -> Result<SyncReport, SyncError> {
        let bindings: Arc<Vec<ResourceBinding>> = Arc::new(integration.resources.clone());
        let limits = self.options.pagination;

        let mirror_store = Arc::clone(&self.store);
        let prune_store = Arc::clone(&self.store);
        let prune_supervisor = Arc::clone(&self.supervisor);
        let hooks = self.hooks.clone();

        SyncChain::new(PipelineContext::new(job), Arc::clone(&self.supervisor))
            .with_step_timeout(self.options.step_timeout)
            .step("mirror", move |ctx, ()| async move {
                let walks = bindings
                    .iter()
                    .map(|binding| mirror_resource(&ctx, binding, mirror_store.as_ref(), limits));
                let resources = join_all(walks)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SyncReport {
                    job_id: ctx.job_id(),
                    scope: ctx.scope().clone(),
                    resources,
                })
            })
            .finalize("prune", move |ctx, mut report: SyncReport| async move {
                for resource in &mut report.resources {
                    if resource.resumed {
                        warn!(
                            resource = %resource.resource,
                            "walk resumed from a checkpoint; prune deferred to the next full walk"
                        );
                        continue;
                    }
                    let deleted = prune(
                        prune_store.as_ref(),
                        prune_supervisor.as_ref(),
                        &resource.table,
                        ctx.scope(),
                        ctx.job_id(),
                    )
                    .await?;
                    resource.pruned = Some(deleted);
                }
                for hook in &hooks {
                    hook.apply(&ctx, prune_store.as_ref(), &report).await?;
                }
                Ok(report)
            })
            .run()
            .await
    }
}
