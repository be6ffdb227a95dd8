//! Task orchestration and the credential retry loop
//!
//! One `run` call drives a task through:
//!
//! `Preparing → Selecting → Uploading → Transforming → Downloading → Finalizing`
//!
//! Any request failure is classified. Credential failures disable the key and
//! rotate at once; transient failures back off linearly and retry; task
//! failures end the run. Attempts are capped at the pool size.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use key_pool::{Pool, RetryDecision, SelectedCredential, backoff_delay, classify};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};
use transport::{ApiClient, ApiError, Payload, ProgressFn, ShrinkOutput, TransformRequest};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::events::{PipelineEvent, Stage};
use crate::metrics;
use crate::progress::{ProgressEmitter, REUPLOAD_RANGE};
use crate::task::{CompressionTask, Input, TransformPlan};

/// Default linear backoff unit.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff before retry `n` (0-based) is `retry_base × (n + 1)`.
    pub retry_base: Duration,
    /// Broadcast buffer; lagging subscribers drop older events.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base: DEFAULT_RETRY_BASE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub task_id: Uuid,
    pub buffer: Bytes,
    /// `None` for remote sources the service did not size.
    pub original_size: Option<u64>,
    pub compressed_size: u64,
    /// Never negative; a larger output counts as zero savings.
    pub saved_bytes: u64,
    /// `0.0` when the original size is unknown.
    pub saved_percent: f64,
    pub content_type: Option<String>,
    pub credential_index: usize,
    pub attempts: u32,
}

/// Output of one successful attempt.
struct AttemptOutput {
    payload: Payload,
    server_input_size: Option<u64>,
    server_output_type: Option<String>,
}

/// Per-task state shared by every attempt.
struct TaskContext<'a> {
    task_id: Uuid,
    input: &'a Input,
    plan: &'a TransformPlan,
    progress: &'a Arc<ProgressEmitter>,
    token: &'a CancellationToken,
}

pub struct Orchestrator {
    client: ApiClient,
    pool: Arc<Pool>,
    events: broadcast::Sender<PipelineEvent>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(client: ApiClient, pool: Arc<Pool>, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            client,
            pool,
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Run one task to completion.
    ///
    /// Cancelling `token` aborts in-flight requests and backoff sleeps and
    /// returns `PipelineError::Cancelled` without touching pool state.
    #[instrument(skip_all, fields(task_id))]
    pub async fn run(
        &self,
        task: CompressionTask,
        token: &CancellationToken,
    ) -> Result<CompressionResult> {
        let task_id = Uuid::new_v4();
        Span::current().record("task_id", tracing::field::display(task_id));
        let started = Instant::now();

        let mut last_index = None;
        let result = self.execute(task_id, task, token, &mut last_index).await;

        match &result {
            Ok(done) => {
                metrics::record_task("success", started.elapsed());
                metrics::record_saved_bytes(done.saved_bytes);
                info!(
                    credential = done.credential_index,
                    attempts = done.attempts,
                    original_size = ?done.original_size,
                    compressed_size = done.compressed_size,
                    saved_percent = done.saved_percent,
                    "task completed"
                );
            }
            Err(err) => {
                metrics::record_task(err.outcome(), started.elapsed());
                warn!(error = %err, "task failed");
                self.emit(PipelineEvent::Error {
                    task_id,
                    kind: err.kind(),
                    index: last_index,
                    message: err.to_string(),
                    status: err.status(),
                });
            }
        }
        result
    }

    async fn execute(
        &self,
        task_id: Uuid,
        task: CompressionTask,
        token: &CancellationToken,
        last_index: &mut Option<usize>,
    ) -> Result<CompressionResult> {
        // Preparing
        task.options
            .validate()
            .map_err(PipelineError::InvalidTask)?;
        let plan = task.options.plan();
        let source_kind = task.source.kind();
        let description = task.source.describe();

        let input = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            loaded = task.source.load() => loaded?,
        };
        let local_size = input.local_size();

        self.emit(PipelineEvent::Start {
            task_id,
            source: source_kind,
            description,
            original_size: local_size,
            plan: plan.label(),
        });
        info!(source = source_kind.label(), plan = plan.label(), size = ?local_size, "task started");

        let progress = Arc::new(ProgressEmitter::new(task_id, plan.clone(), self.events.clone()));
        let ctx = TaskContext {
            task_id,
            input: &input,
            plan: &plan,
            progress: &progress,
            token,
        };

        let max_attempts = u32::try_from(self.pool.len()).unwrap_or(u32::MAX);
        let mut last_failure: Option<(key_pool::ErrorKind, ApiError)> = None;
        let mut pinned: Option<usize> = None;

        for attempt in 0..max_attempts {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            // Selecting
            self.emit(PipelineEvent::Selecting {
                task_id,
                attempt,
                max_attempts,
            });
            let selected = match pinned.take() {
                Some(index) => self.pool.select_index(index).await,
                None => self.pool.select().await,
            };
            let credential = match selected {
                Ok(credential) => credential,
                Err(pool_err) => {
                    return Err(match last_failure {
                        Some((kind, source)) => {
                            debug!(error = %pool_err, "no credential left to retry with");
                            PipelineError::Failed {
                                attempts: attempt,
                                kind,
                                source,
                            }
                        }
                        None => PipelineError::Pool(pool_err),
                    });
                }
            };
            *last_index = Some(credential.index);
            debug!(attempt, credential = credential.index, remaining = ?credential.remaining, "attempt starting");

            let err = match self.attempt(&ctx, &credential).await {
                Ok(output) => {
                    return Ok(self.finalize(&ctx, output, local_size, credential.index, attempt + 1));
                }
                Err(ApiError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(_) if token.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(err) => err,
            };

            let classification = classify(&err);
            metrics::record_failure(classification.kind);
            let is_last = attempt + 1 >= max_attempts;

            match classification.decision {
                RetryDecision::Rotate => {
                    warn!(
                        credential = credential.index,
                        kind = classification.kind.label(),
                        error = %err,
                        "credential rejected, rotating"
                    );
                    self.pool
                        .mark_failed(credential.index, classification.message.clone())
                        .await?;
                    self.emit(PipelineEvent::KeyError {
                        task_id,
                        index: credential.index,
                        kind: classification.kind,
                        message: classification.message.clone(),
                    });
                }
                RetryDecision::RetrySame => {
                    warn!(credential = credential.index, attempt, error = %err, "transient failure, retrying same credential");
                    pinned = Some(credential.index);
                    if !is_last {
                        self.backoff(attempt, token).await?;
                    }
                }
                RetryDecision::RetryAny => {
                    warn!(credential = credential.index, attempt, error = %err, "transient failure, retrying");
                    if !is_last {
                        self.backoff(attempt, token).await?;
                    }
                }
                RetryDecision::Fail => {
                    return Err(PipelineError::Failed {
                        attempts: attempt + 1,
                        kind: classification.kind,
                        source: err,
                    });
                }
            }
            last_failure = Some((classification.kind, err));
        }

        match last_failure {
            Some((kind, source)) => Err(PipelineError::Failed {
                attempts: max_attempts,
                kind,
                source,
            }),
            // Only reachable with an empty pool, which `Pool::new` refuses.
            None => Err(PipelineError::Pool(key_pool::Error::NoCredentials)),
        }
    }

    /// Upload, transform and download with a single credential.
    async fn attempt(
        &self,
        ctx: &TaskContext<'_>,
        credential: &SelectedCredential,
    ) -> std::result::Result<AttemptOutput, ApiError> {
        let shrink = self
            .upload(ctx, credential, ctx.input.clone(), ctx.progress.callback(Stage::Upload))
            .await?;
        ctx.progress.complete(Stage::Upload, "Upload complete");

        let payload = match ctx.plan {
            TransformPlan::None => {
                let result = self
                    .client
                    .download(
                        &credential.secret,
                        &shrink.handle,
                        Some(ctx.progress.callback(Stage::Download)),
                        ctx.token,
                    )
                    .await;
                self.settle(ctx, credential, Stage::Download, result).await?
            }
            TransformPlan::Resize(resize) => {
                self.transform(ctx, credential, &shrink.handle, &TransformRequest::resize(resize), Stage::Resize)
                    .await?
            }
            TransformPlan::Convert(convert) => {
                self.transform(ctx, credential, &shrink.handle, &TransformRequest::convert(convert), Stage::Convert)
                    .await?
            }
            TransformPlan::Combined(resize, convert) => {
                self.transform(
                    ctx,
                    credential,
                    &shrink.handle,
                    &TransformRequest::combined(resize, convert),
                    Stage::Resize,
                )
                .await?
            }
            TransformPlan::Sequential(resize, convert) => {
                let resized = self
                    .transform(ctx, credential, &shrink.handle, &TransformRequest::resize(resize), Stage::Resize)
                    .await?;
                ctx.progress
                    .mark(Stage::Upload, REUPLOAD_RANGE.start, "Re-uploading resized image");
                let reuploaded = self
                    .upload(
                        ctx,
                        credential,
                        Input::Bytes(resized.body),
                        ctx.progress.callback_in(Stage::Upload, REUPLOAD_RANGE),
                    )
                    .await?;
                self.transform(
                    ctx,
                    credential,
                    &reuploaded.handle,
                    &TransformRequest::convert(convert),
                    Stage::Convert,
                )
                .await?
            }
        };

        Ok(AttemptOutput {
            payload,
            server_input_size: shrink.input_size,
            server_output_type: shrink.output_type,
        })
    }

    async fn upload(
        &self,
        ctx: &TaskContext<'_>,
        credential: &SelectedCredential,
        input: Input,
        progress: ProgressFn,
    ) -> std::result::Result<ShrinkOutput, ApiError> {
        let result = match input {
            Input::Bytes(bytes) => {
                self.client
                    .shrink_bytes(
                        &credential.secret,
                        bytes,
                        Some(progress),
                        ctx.token,
                    )
                    .await
            }
            Input::Url(url) => self.client.shrink_url(&credential.secret, &url, ctx.token).await,
        };
        metrics::record_request(Stage::Upload, result.is_ok());
        let shrink = result?;
        self.apply_usage(ctx.task_id, credential.index, shrink.usage).await;
        Ok(shrink)
    }

    async fn transform(
        &self,
        ctx: &TaskContext<'_>,
        credential: &SelectedCredential,
        handle: &str,
        request: &TransformRequest,
        stage: Stage,
    ) -> std::result::Result<Payload, ApiError> {
        let result = self
            .client
            .transform(
                &credential.secret,
                handle,
                request,
                Some(ctx.progress.callback(stage)),
                ctx.token,
            )
            .await;
        self.settle(ctx, credential, stage, result).await
    }

    /// Record a stage outcome and feed its usage counter to the pool.
    async fn settle(
        &self,
        ctx: &TaskContext<'_>,
        credential: &SelectedCredential,
        stage: Stage,
        result: std::result::Result<Payload, ApiError>,
    ) -> std::result::Result<Payload, ApiError> {
        metrics::record_request(stage, result.is_ok());
        let payload = result?;
        self.apply_usage(ctx.task_id, credential.index, payload.usage)
            .await;
        ctx.progress.complete(stage, format!("{} complete", capitalize(stage.label())));
        Ok(payload)
    }

    async fn apply_usage(&self, task_id: Uuid, index: usize, usage: Option<u64>) {
        match self.pool.update_usage(index, usage).await {
            Ok(Some(update)) => {
                metrics::record_credential_usage(index, update.used);
                self.emit(PipelineEvent::QuotaUpdate {
                    task_id,
                    index,
                    used: update.used,
                    remaining: update.remaining,
                    limit: update.limit,
                });
            }
            Ok(None) => debug!(credential = index, "response carried no usage counter"),
            Err(e) => warn!(credential = index, error = %e, "failed to record usage"),
        }
    }

    fn finalize(
        &self,
        ctx: &TaskContext<'_>,
        output: AttemptOutput,
        local_size: Option<u64>,
        credential_index: usize,
        attempts: u32,
    ) -> CompressionResult {
        let buffer = output.payload.body;
        let compressed_size = buffer.len() as u64;
        let original_size = local_size.or(output.server_input_size);
        let saved_bytes = original_size
            .map(|original| original.saturating_sub(compressed_size))
            .unwrap_or(0);
        let saved_percent = match original_size {
            Some(original) if original > 0 => saved_bytes as f64 / original as f64 * 100.0,
            _ => 0.0,
        };

        ctx.progress.complete(Stage::Finalize, "Done");
        self.emit(PipelineEvent::Success {
            task_id: ctx.task_id,
            original_size,
            compressed_size,
            saved_bytes,
            saved_percent,
            credential_index,
            attempts,
        });

        CompressionResult {
            task_id: ctx.task_id,
            buffer,
            original_size,
            compressed_size,
            saved_bytes,
            saved_percent,
            content_type: output.payload.content_type.or(output.server_output_type),
            credential_index,
            attempts,
        }
    }

    async fn backoff(&self, attempt: u32, token: &CancellationToken) -> Result<()> {
        let delay = backoff_delay(self.config.retry_base, attempt);
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
