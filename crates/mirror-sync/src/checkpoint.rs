//! Resumable pagination: cursors live in job state under `checkpoint.<resource>`,
//! advance only after a page has been written and are cleared once a walk
//! reaches its last page.

use std::time::Duration;

use async_trait::async_trait;
use mirror_adapters::{AdapterContext, SourceAdapter};
use mirror_core::{SyncError, CHECKPOINT_STATE_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineContext;

pub const DEFAULT_MAX_PAGES: u64 = 10_000;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// A walk in progress: the cursor of the next page and how many pages are behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub cursor: String,
    pub pages: u64,
}

pub fn checkpoint_key(resource: &str) -> String {
    format!("{CHECKPOINT_STATE_PREFIX}{resource}")
}

/// Reads the stored checkpoint; an unreadable one is dropped so the walk starts over.
pub async fn load_checkpoint(ctx: &PipelineContext, resource: &str) -> Option<CheckpointState> {
    let key = checkpoint_key(resource);
    let value = ctx.get_state(&key).await?;
    match serde_json::from_value::<CheckpointState>(value) {
        Ok(checkpoint) => Some(checkpoint),
        Err(err) => {
            warn!(resource, error = %err, "ignoring malformed checkpoint");
            ctx.clear_state(&key).await;
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationLimits {
    pub max_pages: u64,
    pub fetch_timeout: Duration,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Receives every fetched page. The walk only checkpoints past a page once
/// its sink has returned, so a stored cursor never skips unwritten rows.
#[async_trait]
pub trait PageSink: Send {
    async fn write_page(&mut self, items: Vec<Value>) -> Result<(), SyncError>;
}

#[async_trait]
impl PageSink for Vec<Value> {
    async fn write_page(&mut self, items: Vec<Value>) -> Result<(), SyncError> {
        self.extend(items);
        Ok(())
    }
}

/// What one resource walk covered in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub pages: u64,
    pub items: usize,
    /// The walk continued a checkpoint, so earlier pages were written by an earlier job.
    pub resumed: bool,
}

/// Walks every page of `adapter` into `sink`, starting from the stored checkpoint if any.
pub async fn paginate(
    ctx: &PipelineContext,
    adapter: &dyn SourceAdapter,
    resource: &str,
    limits: PaginationLimits,
    sink: &mut dyn PageSink,
) -> Result<WalkSummary, SyncError> {
    let key = checkpoint_key(resource);
    let checkpoint = load_checkpoint(ctx, resource).await;
    let resumed = checkpoint.is_some();
    let (mut cursor, mut total_pages) = match checkpoint {
        Some(CheckpointState { cursor, pages }) => {
            info!(resource, %cursor, pages, "resuming pagination from checkpoint");
            (Some(cursor), pages)
        }
        None => (None, 0),
    };

    let adapter_ctx = AdapterContext {
        job_id: ctx.job_id(),
        scope: ctx.scope().clone(),
    };
    let mut items = 0usize;
    let mut pages_this_run = 0u64;

    loop {
        if pages_this_run >= limits.max_pages {
            return Err(SyncError::adapter(
                resource,
                format!("pagination exceeded {} pages", limits.max_pages),
            ));
        }

        let page = tokio::time::timeout(
            limits.fetch_timeout,
            adapter.fetch_page(&adapter_ctx, cursor.as_deref()),
        )
        .await
        .map_err(|_| SyncError::Timeout {
            operation: format!("fetch page of {resource}"),
            timeout_ms: limits.fetch_timeout.as_millis() as u64,
        })?
        .map_err(|err| SyncError::adapter(resource, err))?;

        debug!(resource, page = total_pages + 1, items = page.items.len(), "fetched page");
        items += page.items.len();
        sink.write_page(page.items).await?;
        pages_this_run += 1;
        total_pages += 1;

        match page.next_cursor {
            Some(next) => {
                let state = CheckpointState {
                    cursor: next.clone(),
                    pages: total_pages,
                };
                let value = serde_json::to_value(&state)
                    .map_err(|err| SyncError::storage("encoding checkpoint", err))?;
                ctx.set_state(key.clone(), value).await;
                cursor = Some(next);
            }
            None => {
                ctx.clear_state(&key).await;
                break;
            }
        }
    }

    Ok(WalkSummary {
        pages: pages_this_run,
        items,
        resumed,
    })
}
