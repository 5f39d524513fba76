use async_trait::async_trait;
use mirror_core::SyncError;
use mirror_storage::RowStore;
use serde_json::json;

use crate::pipeline::PipelineContext;
use crate::runner::SyncReport;

pub const METRICS_STATE_PREFIX: &str = "metrics.";

/// Derived-data recomputation run by the finalizer after pruning.
#[async_trait]
pub trait FinalizeHook: Send + Sync {
    async fn apply(
        &self,
        ctx: &PipelineContext,
        store: &dyn RowStore,
        report: &SyncReport,
    ) -> Result<(), SyncError>;
}

/// Records the mirror size and run counters of each resource in job state.
#[derive(Default)]
pub struct RowCountMetrics;

#[async_trait]
impl FinalizeHook for RowCountMetrics {
    async fn apply(
        &self,
        ctx: &PipelineContext,
        store: &dyn RowStore,
        report: &SyncReport,
    ) -> Result<(), SyncError> {
        let scope_filter = ctx.scope().filter();
        for resource in &report.resources {
            let rows = store.count(&resource.table, &scope_filter).await?;
            ctx.set_state(
                format!("{METRICS_STATE_PREFIX}{}", resource.resource),
                json!({
                    "rows": rows,
                    "fetched": resource.fetched,
                    "inserted": resource.inserted,
                    "updated": resource.updated,
                    "pruned": resource.pruned,
                }),
            )
            .await;
        }
        Ok(())
    }
}
