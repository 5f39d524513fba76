//! The sync chain: ordered, typed steps over a shared job context, fail-fast
//! abort, an optional finalizer and a single terminal status write.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use mirror_core::{JobId, JobState, JobStatus, Scope, SyncError, SyncJob};
use mirror_storage::JobSupervisor;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

type AnyBox = Box<dyn Any + Send>;
type StepFuture = BoxFuture<'static, Result<AnyBox, SyncError>>;
type ErasedRun = Box<dyn FnOnce(PipelineContext, AnyBox) -> StepFuture + Send>;

struct ErasedStep {
    name: String,
    run: ErasedRun,
}

/// Per-run handle on the job being executed.
///
/// State writes land in a buffer seeded from the job's stored state and are
/// only persisted by the terminal status write at the end of [`SyncChain::run`].
#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job: SyncJob,
    state: Mutex<JobState>,
}

impl PipelineContext {
    pub fn new(job: SyncJob) -> Self {
        let state = job.state.clone();
        Self {
            inner: Arc::new(ContextInner {
                job,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job.id
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.job.scope
    }

    pub async fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().await.get(key).cloned()
    }

    pub async fn set_state(&self, key: impl Into<String>, value: Value) {
        self.inner.state.lock().await.insert(key.into(), value);
    }

    pub async fn clear_state(&self, key: &str) {
        self.inner.state.lock().await.remove(key);
    }

    /// The buffered state as it would be flushed right now.
    pub async fn state_snapshot(&self) -> JobState {
        self.inner.state.lock().await.clone()
    }
}

/// A chain whose last registered step produces `T`.
pub struct SyncChain<T> {
    ctx: PipelineContext,
    supervisor: Arc<dyn JobSupervisor>,
    step_timeout: Duration,
    steps: Vec<ErasedStep>,
    _output: PhantomData<fn() -> T>,
}

/// A chain with its finalizer registered; only `run` remains.
pub struct FinalizedChain<T> {
    chain: SyncChain<T>,
    finalizer: ErasedStep,
}

fn erase<T, U, F, Fut>(name: &str, f: F) -> ErasedRun
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnOnce(PipelineContext, T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<U, SyncError>> + Send + 'static,
{
    let name = name.to_string();
    Box::new(
        move |ctx: PipelineContext, input: AnyBox| -> StepFuture {
            Box::pin(async move {
                let input = input.downcast::<T>().map_err(|_| {
                    SyncError::Config(format!("step `{name}` received an unexpected input type"))
                })?;
                let output = f(ctx, *input).await?;
                Ok(Box::new(output) as AnyBox)
            })
        },
    )
}

impl SyncChain<()> {
    pub fn new(ctx: PipelineContext, supervisor: Arc<dyn JobSupervisor>) -> Self {
        Self {
            ctx,
            supervisor,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            steps: Vec::new(),
            _output: PhantomData,
        }
    }
}

impl<T: Send + 'static> SyncChain<T> {
    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Appends a step fed with the previous step's output.
    pub fn step<U, F, Fut>(mut self, name: impl Into<String>, f: F) -> SyncChain<U>
    where
        U: Send + 'static,
        F: FnOnce(PipelineContext, T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, SyncError>> + Send + 'static,
    {
        let name = name.into();
        let run = erase(&name, f);
        self.steps.push(ErasedStep { name, run });
        SyncChain {
            ctx: self.ctx,
            supervisor: self.supervisor,
            step_timeout: self.step_timeout,
            steps: self.steps,
            _output: PhantomData,
        }
    }

    /// Registers the finalizer. It only runs when every step succeeded.
    pub fn finalize<F, Fut>(self, name: impl Into<String>, f: F) -> FinalizedChain<T>
    where
        F: FnOnce(PipelineContext, T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let name = name.into();
        let run = erase(&name, f);
        FinalizedChain {
            chain: self,
            finalizer: ErasedStep { name, run },
        }
    }

    pub async fn run(self) -> Result<T, SyncError> {
        execute(self, None).await
    }
}

impl<T: Send + 'static> FinalizedChain<T> {
    pub async fn run(self) -> Result<T, SyncError> {
        execute(self.chain, Some(self.finalizer)).await
    }
}

async fn execute<T: Send + 'static>(
    chain: SyncChain<T>,
    finalizer: Option<ErasedStep>,
) -> Result<T, SyncError> {
    let SyncChain {
        ctx,
        supervisor,
        step_timeout,
        steps,
        ..
    } = chain;
    let job_id = ctx.job_id();

    let outcome = run_steps(&ctx, steps, finalizer, step_timeout).await;
    let (status, message) = match &outcome {
        Ok(_) => (JobStatus::Completed, None),
        Err(err) => (JobStatus::Failed, Some(err.to_string())),
    };

    let state = ctx.state_snapshot().await;
    if let Err(mark_err) = supervisor
        .mark_job_status(job_id, status, state, message)
        .await
    {
        error!(%job_id, error = %mark_err, "failed to record terminal job status");
        // The run's own failure is the more useful error to surface.
        outcome?;
        return Err(mark_err);
    }

    match &outcome {
        Ok(_) => info!(%job_id, "sync job completed"),
        Err(err) => warn!(%job_id, kind = err.kind(), error = %err, "sync job failed"),
    }
    outcome
}

async fn run_steps<T: Send + 'static>(
    ctx: &PipelineContext,
    steps: Vec<ErasedStep>,
    finalizer: Option<ErasedStep>,
    step_timeout: Duration,
) -> Result<T, SyncError> {
    let mut data: AnyBox = Box::new(());
    for step in steps.into_iter().chain(finalizer) {
        data = run_step(ctx, step, data, step_timeout).await?;
    }
    data.downcast::<T>()
        .map(|output| *output)
        .map_err(|_| SyncError::Config("chain output has an unexpected type".to_string()))
}

async fn run_step(
    ctx: &PipelineContext,
    step: ErasedStep,
    input: AnyBox,
    step_timeout: Duration,
) -> Result<AnyBox, SyncError> {
    let ErasedStep { name, run } = step;
    let span = info_span!("sync_step", job_id = %ctx.job_id(), step = %name);
    async move {
        let started = Instant::now();
        info!("step started");
        match tokio::time::timeout(step_timeout, run(ctx.clone(), input)).await {
            Ok(Ok(output)) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "step completed");
                Ok(output)
            }
            Ok(Err(err)) => {
                warn!(kind = err.kind(), error = %err, "step failed");
                Err(err)
            }
            Err(_) => {
                warn!(timeout_ms = step_timeout.as_millis() as u64, "step timed out");
                Err(SyncError::Timeout {
                    operation: format!("step `{name}`"),
                    timeout_ms: step_timeout.as_millis() as u64,
                })
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_storage::MemoryJobSupervisor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn running_job(supervisor: &MemoryJobSupervisor) -> SyncJob {
        let job = supervisor
            .create_job(&Scope::new("t1", "billing", None))
            .await
            .expect("create");
        supervisor.begin_job(job.id).await.expect("begin")
    }

    #[tokio::test]
    async fn steps_feed_each_other_and_finalizer_sees_the_result() {
        let supervisor = Arc::new(MemoryJobSupervisor::new());
        let job = running_job(&supervisor).await;
        let ctx = PipelineContext::new(job.clone());

        let output = SyncChain::new(ctx, supervisor.clone())
            .step("count", |_ctx, ()| async { Ok(2_u32) })
            .step("double", |_ctx, n: u32| async move { Ok(vec![n; 2]) })
            .finalize("sum", |ctx, items: Vec<u32>| async move {
                ctx.set_state("sum", json!(items.iter().sum::<u32>())).await;
                Ok(items)
            })
            .run()
            .await
            .expect("run");
        assert_eq!(output, vec![2, 2]);

        let stored = supervisor.load_job(job.id).await.expect("load");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.state.get("sum"), Some(&json!(4)));
        assert!(stored.error.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn failing_step_skips_the_rest_and_the_finalizer() {
        let supervisor = Arc::new(MemoryJobSupervisor::new());
        let job = running_job(&supervisor).await;
        let ran = Arc::new(AtomicUsize::new(0));

        let (third, fin) = (ran.clone(), ran.clone());
        let result = SyncChain::new(PipelineContext::new(job.clone()), supervisor.clone())
            .step("one", |ctx, ()| async move {
                ctx.set_state("checkpoint.users", json!({ "cursor": "2", "pages": 2 }))
                    .await;
                Ok(())
            })
            .step("two", |_ctx, ()| async {
                Err::<(), _>(SyncError::adapter("users", "upstream returned 502"))
            })
            .step("three", move |_ctx, ()| async move {
                third.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .finalize("prune", move |_ctx, ()| async move {
                fin.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await;

        assert!(matches!(result, Err(SyncError::Adapter { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let stored = supervisor.load_job(job.id).await.expect("load");
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored
            .error
            .as_deref()
            .is_some_and(|e| e.contains("upstream returned 502")));
        // Buffered state is flushed with the failure.
        assert!(stored.state.contains_key("checkpoint.users"));
    }

    #[tokio::test]
    async fn state_writes_are_buffered_until_the_run_ends() {
        let supervisor = Arc::new(MemoryJobSupervisor::new());
        let job = running_job(&supervisor).await;
        let probe = supervisor.clone();
        let job_id = job.id;

        SyncChain::new(PipelineContext::new(job), supervisor.clone())
            .step("write", move |ctx, ()| async move {
                ctx.set_state("checkpoint.devices", json!({ "cursor": "9", "pages": 1 }))
                    .await;
                assert!(ctx.get_state("checkpoint.devices").await.is_some());
                let persisted = probe.load_job(job_id).await?;
                assert!(persisted.state.is_empty());
                ctx.clear_state("checkpoint.devices").await;
                Ok(())
            })
            .run()
            .await
            .expect("run");

        let stored = supervisor.load_job(job_id).await.expect("load");
        assert!(stored.state.is_empty());
    }

    #[tokio::test]
    async fn slow_step_times_out_as_a_failure() {
        let supervisor = Arc::new(MemoryJobSupervisor::new());
        let job = running_job(&supervisor).await;

        let result = SyncChain::new(PipelineContext::new(job.clone()), supervisor.clone())
            .with_step_timeout(Duration::from_millis(20))
            .step("hang", |_ctx, ()| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .run()
            .await;

        assert!(matches!(result, Err(SyncError::Timeout { .. })));
        let stored = supervisor.load_job(job.id).await.expect("load");
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn terminal_status_is_written_once() {
        let supervisor = Arc::new(MemoryJobSupervisor::new());
        let job = running_job(&supervisor).await;

        SyncChain::new(PipelineContext::new(job.clone()), supervisor.clone())
            .run()
            .await
            .expect("empty chain");

        // A second terminal write is refused, so a re-run of the same job fails.
        let again = SyncChain::new(PipelineContext::new(job), supervisor.clone())
            .run()
            .await;
        assert!(matches!(again, Err(SyncError::JobState { .. })));
    }
}
