//! The execution engine: `start`, the idempotent task handler set, and the
//! retry/abort machinery.
//!
//! Every state transition happens inside a short-lived handler driven by
//! the task queue at least once. Correctness rests on three mechanisms:
//! state-guarded store transitions (re-delivery is a no-op), deterministic
//! task names (duplicates are dropped at enqueue), and a per-pipeline
//! attempt counter (stale tasks are dropped on load).

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::builder::{ChildDefaults, ChildDescriptor};
use crate::codec::{Codec, MAX_INLINE_BYTES};
use crate::error::{CodecError, EngineError};
use crate::future::{StageFuture, DEFAULT_OUTPUT};
use crate::queue::{QueueError, Task, TaskQueue};
use crate::slot::{Outputs, Slot};
use crate::stage::{
    CallArg, CallbackAccess, CallbackMode, FinalizeInfo, RunContext, Stage, StageCall, StageKind,
    StageRegistry, StatusUpdate,
};
use crate::store::{ChildGraph, CommitOutcome, FillOutcome, RecordStore, RootGraph};
use crate::types::*;

// ─── Configuration ────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base path the task URLs live under.
    pub base_path: String,
    /// Queue name recorded in parameter records.
    pub default_queue: String,
    pub max_inline_bytes: usize,
    /// Barrier-index rows examined per `output` task before continuing in a
    /// follow-up task.
    pub notify_batch_size: usize,
    /// Pipelines examined per `fanout_abort` task.
    pub abort_batch_size: usize,
    pub default_retry: RetryParams,
    pub default_task_retry: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_path: "/_ah/pipeline".to_string(),
            default_queue: "default".to_string(),
            max_inline_bytes: MAX_INLINE_BYTES,
            notify_batch_size: 10,
            abort_batch_size: 10,
            default_retry: RetryParams::default(),
            default_task_retry: false,
        }
    }
}

/// Options accepted by `Engine::start`.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Caller-chosen pipeline id for idempotent starts.
    pub idempotence_key: Option<Uuid>,
    /// Seconds from now before the first run; mutually exclusive with `eta`.
    pub countdown_seconds: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
    pub queue_name: Option<String>,
    pub target: Option<String>,
    /// Delete the whole record closure once the root finalizes.
    pub cleanup_on_done: bool,
}

// ─── Callback plumbing ────────────────────────────────────────

/// What the transport layer knows about a callback request's origin.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallbackAuth {
    pub from_task_queue: bool,
    pub is_admin: bool,
}

#[derive(Clone, Debug)]
pub struct CallbackRequest {
    pub pipeline_id: Uuid,
    /// User parameters, excluding `pipeline_id`.
    pub params: Vec<(String, String)>,
    pub auth: CallbackAuth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Dispatched,
    Forbidden,
    NotFound,
    /// The target stage is not asynchronous.
    NotSupported,
    /// Terminal pipeline; the event was logged and dropped.
    Ignored,
}

/// What an async stage's `callback` can see and do. Unlike `RunContext`,
/// effects here hit the store immediately.
pub struct CallbackContext<'a> {
    engine: &'a Engine,
    record: PipelineRecord,
    params: ParamRecord,
    request_params: Vec<(String, String)>,
    future: StageFuture,
}

impl CallbackContext<'_> {
    pub fn pipeline_id(&self) -> Uuid {
        self.record.id
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.request_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.request_params
    }

    /// Fill a named output slot.
    pub async fn fill(&self, name: &str, value: JsonValue) -> Result<(), EngineError> {
        let handle = self.future.output(name)?;
        self.engine
            .fill_and_notify(
                self.record.root_pipeline_id,
                self.record.id,
                handle.key(),
                &value,
            )
            .await
            .map_err(step_to_engine)
    }

    /// Fill the default slot, which lets the stage finalize.
    pub async fn complete(&self, value: JsonValue) -> Result<(), EngineError> {
        self.fill(DEFAULT_OUTPUT, value).await
    }

    /// Author-driven retry with backoff.
    pub async fn retry(&self, message: &str) -> Result<(), EngineError> {
        self.engine
            .schedule_retry(&self.record, &self.params, message)
            .await
            .map_err(|e| EngineError::other(format!("{e:#}")))
    }

    /// Abort the whole workflow.
    pub async fn abort(&self, message: &str) -> Result<(), EngineError> {
        self.engine
            .begin_root_abort(self.record.root_pipeline_id, Some(message))
            .await
            .map_err(|e| EngineError::other(format!("{e:#}")))
    }

    pub async fn set_status(&self, update: StatusUpdate) -> Result<(), EngineError> {
        self.engine
            .set_status(self.record.id, update)
            .await
            .map_err(|e| EngineError::other(format!("{e:#}")))
    }
}

// ─── Internal error split ─────────────────────────────────────

/// Handlers separate stage-level failures (fed to the retry machinery)
/// from infrastructure failures (surfaced so the task queue retries).
enum StepError {
    Stage(EngineError),
    Infra(anyhow::Error),
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        StepError::Stage(err)
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        StepError::Infra(err)
    }
}

/// Serialization problems are the producing stage's fault; blob and store
/// trouble is transient infrastructure.
fn classify_codec(err: CodecError) -> StepError {
    match err {
        CodecError::Json(_) => StepError::Stage(EngineError::Serialization(err)),
        CodecError::Blob(_) | CodecError::EmptyDocument => StepError::Infra(anyhow!("{err}")),
    }
}

fn step_to_engine(err: StepError) -> EngineError {
    match err {
        StepError::Stage(e) => e,
        StepError::Infra(e) => EngineError::other(format!("{e:#}")),
    }
}

// ─── Task parameter structs ───────────────────────────────────

#[derive(Clone, Debug)]
pub struct RunTaskParams {
    pub pipeline_key: Uuid,
    pub attempt: u32,
}

#[derive(Clone, Debug)]
pub struct OutputTaskParams {
    pub slot_key: Uuid,
    pub cursor: Option<String>,
    pub batch: u32,
}

#[derive(Clone, Debug)]
pub struct FinalizedTaskParams {
    pub pipeline_key: Uuid,
}

#[derive(Clone, Debug)]
pub struct FanoutTaskParams {
    pub parent_key: Uuid,
    pub child_indexes: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct FanoutAbortTaskParams {
    pub root_pipeline_key: Uuid,
    pub cursor: Option<String>,
    pub batch: u32,
}

#[derive(Clone, Debug)]
pub struct AbortTaskParams {
    pub pipeline_key: Uuid,
}

#[derive(Clone, Debug)]
pub struct CleanupTaskParams {
    pub root_pipeline_key: Uuid,
}

// ─── Engine ───────────────────────────────────────────────────

pub struct Engine {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<StageRegistry>,
    codec: Codec,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        blobs: Arc<dyn BlobStore>,
        registry: Arc<StageRegistry>,
    ) -> Self {
        let config = EngineConfig::default();
        let codec = Codec::new(blobs).with_max_inline_bytes(config.max_inline_bytes);
        Self {
            store,
            queue,
            registry,
            codec,
            config,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.codec = self.codec.with_max_inline_bytes(config.max_inline_bytes);
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub(crate) fn codec(&self) -> &Codec {
        &self.codec
    }

    // ── Public API ──

    /// Create a root pipeline and enqueue its first run.
    pub async fn start(&self, call: StageCall, opts: StartOptions) -> Result<Uuid, EngineError> {
        if opts.countdown_seconds.is_some() && opts.eta.is_some() {
            return Err(EngineError::Setup(
                "cannot use both countdown and eta".to_string(),
            ));
        }
        if call
            .args
            .iter()
            .chain(call.kwargs.values())
            .any(|arg| matches!(arg, CallArg::Slot(_)))
        {
            return Err(EngineError::Setup(
                "root arguments must be concrete values, not slots".to_string(),
            ));
        }

        let stage = self
            .registry
            .lookup(&call.class_path)
            .ok_or_else(|| EngineError::UnknownClassPath(call.class_path.clone()))?;

        let id = opts.idempotence_key.unwrap_or_else(Uuid::now_v7);
        let future = StageFuture::new(call.class_path.clone(), &stage.output_names());
        let retry = call.retry_params(self.config.default_retry);

        let params = ParamRecord {
            class_path: call.class_path.clone(),
            args: call
                .args
                .iter()
                .map(|arg| match arg {
                    CallArg::Value(value) => ArgumentRef::Value {
                        value: value.clone(),
                    },
                    CallArg::Slot(slot_key) => ArgumentRef::Slot {
                        slot_key: *slot_key,
                    },
                })
                .collect(),
            kwargs: call
                .kwargs
                .iter()
                .map(|(name, arg)| {
                    let arg = match arg {
                        CallArg::Value(value) => ArgumentRef::Value {
                            value: value.clone(),
                        },
                        CallArg::Slot(slot_key) => ArgumentRef::Slot {
                            slot_key: *slot_key,
                        },
                    };
                    (name.clone(), arg)
                })
                .collect(),
            output_slots: future.slot_keys(),
            after_all: Vec::new(),
            queue_name: call
                .queue_name
                .clone()
                .or(opts.queue_name.clone())
                .unwrap_or_else(|| self.config.default_queue.clone()),
            base_path: self.config.base_path.clone(),
            target: call.target.clone().or(opts.target.clone()),
            max_attempts: retry.max_attempts,
            backoff_seconds: retry.backoff_seconds,
            backoff_factor: retry.backoff_factor,
            task_retry: call.task_retry.unwrap_or(self.config.default_task_retry),
            cleanup_on_done: opts.cleanup_on_done,
        };

        let params_value = serde_json::to_value(&params).map_err(CodecError::Json)?;
        let params_doc = self.codec.write_value(id, &params_value).await?;

        let slots: Vec<SlotRecord> = future
            .owned_slot_keys()
            .into_iter()
            .map(|slot_id| SlotRecord {
                id: slot_id,
                root_pipeline_id: id,
                filler: None,
                value: None,
                status: SlotStatus::Waiting,
                fill_time: None,
            })
            .collect();

        let finalize_blocking: Vec<Uuid> = future.slot_keys().values().copied().collect();
        let barriers = vec![
            BarrierRecord {
                target_pipeline_id: id,
                purpose: BarrierPurpose::Start,
                root_pipeline_id: id,
                blocking_slots: Vec::new(),
                status: BarrierStatus::Waiting,
                trigger_time: None,
            },
            BarrierRecord {
                target_pipeline_id: id,
                purpose: BarrierPurpose::Finalize,
                root_pipeline_id: id,
                blocking_slots: finalize_blocking.clone(),
                status: BarrierStatus::Waiting,
                trigger_time: None,
            },
        ];
        let barrier_indexes: Vec<BarrierIndexEntry> = finalize_blocking
            .iter()
            .map(|slot_id| BarrierIndexEntry {
                slot_id: *slot_id,
                target_pipeline_id: id,
                purpose: BarrierPurpose::Finalize,
                root_pipeline_id: id,
            })
            .collect();

        let pipeline = PipelineRecord {
            id,
            class_path: call.class_path.clone(),
            root_pipeline_id: id,
            is_root_pipeline: true,
            params: params_doc,
            fanned_out: Vec::new(),
            status: PipelineStatus::Waiting,
            current_attempt: 0,
            max_attempts: retry.max_attempts,
            next_retry_time: None,
            retry_message: None,
            abort_message: None,
            abort_requested: false,
            start_time: None,
            finalized_time: None,
        };

        let created = self
            .store
            .create_root(RootGraph {
                pipeline,
                slots,
                barriers,
                barrier_indexes,
            })
            .await
            .map_err(|e| EngineError::other(format!("{e:#}")))?;
        if !created {
            return Err(EngineError::PipelineExists(id));
        }

        let eta = match (opts.eta, opts.countdown_seconds) {
            (Some(eta), _) => Some(eta),
            (None, Some(secs)) => Some(Utc::now() + Duration::milliseconds((secs * 1000.0) as i64)),
            (None, None) => None,
        };
        let mut task = self.run_task(id, 0);
        if let Some(eta) = eta {
            task = task.eta(eta);
        }
        self.enqueue_dropping_duplicates(task)
            .await
            .map_err(|e| EngineError::other(format!("{e:#}")))?;

        tracing::info!(pipeline_id = %id, class_path = %call.class_path, "pipeline started");
        Ok(id)
    }

    /// Request a whole-workflow abort. Returns false when the target is
    /// missing, not a root, or already finished.
    pub async fn abort(&self, root_pipeline_id: Uuid, message: Option<&str>) -> Result<bool> {
        let Some(rec) = self.store.load_pipeline(root_pipeline_id).await? else {
            return Ok(false);
        };
        if !rec.is_root_pipeline || rec.status.is_terminal() {
            return Ok(false);
        }
        self.begin_root_abort(root_pipeline_id, message).await?;
        Ok(true)
    }

    /// Enqueue deletion of a finished root's record closure.
    pub async fn cleanup(&self, root_pipeline_id: Uuid) -> Result<()> {
        self.enqueue_dropping_duplicates(
            Task::new(format!("{}/cleanup", self.config.base_path))
                .named(format!("cleanup-{root_pipeline_id}"))
                .param("root_pipeline_key", root_pipeline_id.to_string()),
        )
        .await
    }

    /// Write an advisory status record for the UI.
    pub async fn set_status(&self, pipeline_id: Uuid, update: StatusUpdate) -> Result<()> {
        let Some(rec) = self.store.load_pipeline(pipeline_id).await? else {
            bail!("pipeline not found: {pipeline_id}");
        };
        self.store
            .save_status_record(&StatusRecord {
                pipeline_id,
                root_pipeline_id: rec.root_pipeline_id,
                message: update.message,
                console_url: update.console_url,
                links: update.links,
                status_time: Utc::now(),
            })
            .await
    }

    // ── Task dispatch ──

    /// Execute one queue task against the handler it addresses. Used by the
    /// test harness and the dev server's loopback queue; the HTTP layer
    /// calls the typed handlers directly.
    pub async fn dispatch_task(&self, task: &Task) -> Result<()> {
        let endpoint = task.path.rsplit('/').next().unwrap_or_default();
        match endpoint {
            "run" => {
                self.handle_run(RunTaskParams {
                    pipeline_key: parse_uuid_param(task, "pipeline_key")?,
                    attempt: parse_int_param(task, "attempt")?.unwrap_or(0) as u32,
                })
                .await
            }
            "output" => {
                self.handle_output(OutputTaskParams {
                    slot_key: parse_uuid_param(task, "slot_key")?,
                    cursor: task.get_param("cursor").map(str::to_string),
                    batch: parse_int_param(task, "batch")?.unwrap_or(0) as u32,
                })
                .await
            }
            "finalized" => {
                self.handle_finalized(FinalizedTaskParams {
                    pipeline_key: parse_uuid_param(task, "pipeline_key")?,
                })
                .await
            }
            "fanout" => {
                let child_indexes = task
                    .get_params("child_indexes")
                    .into_iter()
                    .map(|raw| raw.parse::<usize>().context("bad child index"))
                    .collect::<Result<Vec<usize>>>()?;
                self.handle_fanout(FanoutTaskParams {
                    parent_key: parse_uuid_param(task, "parent_key")?,
                    child_indexes,
                })
                .await
            }
            "fanout_abort" => {
                self.handle_fanout_abort(FanoutAbortTaskParams {
                    root_pipeline_key: parse_uuid_param(task, "root_pipeline_key")?,
                    cursor: task.get_param("cursor").map(str::to_string),
                    batch: parse_int_param(task, "batch")?.unwrap_or(0) as u32,
                })
                .await
            }
            "abort" => {
                self.handle_abort(AbortTaskParams {
                    pipeline_key: parse_uuid_param(task, "pipeline_key")?,
                })
                .await
            }
            "callback" => {
                let pipeline_id = parse_uuid_param(task, "pipeline_id")?;
                let params: Vec<(String, String)> = task
                    .params
                    .iter()
                    .filter(|(k, _)| k != "pipeline_id")
                    .cloned()
                    .collect();
                let outcome = self
                    .handle_callback(CallbackRequest {
                        pipeline_id,
                        params,
                        auth: CallbackAuth {
                            from_task_queue: true,
                            is_admin: false,
                        },
                    })
                    .await?;
                if outcome != CallbackOutcome::Dispatched {
                    tracing::warn!(pipeline_id = %pipeline_id, ?outcome, "callback task dropped");
                }
                Ok(())
            }
            "cleanup" => {
                self.handle_cleanup(CleanupTaskParams {
                    root_pipeline_key: parse_uuid_param(task, "root_pipeline_key")?,
                })
                .await
            }
            other => bail!("unknown task endpoint: {other}"),
        }
    }

    // ── Handlers ──

    /// START barrier fired (or initial kickoff): evaluate the stage.
    pub async fn handle_run(&self, params: RunTaskParams) -> Result<()> {
        let now = Utc::now();
        let Some(rec) = self.store.load_pipeline(params.pipeline_key).await? else {
            tracing::warn!(pipeline_id = %params.pipeline_key, "run task for missing pipeline, dropping");
            return Ok(());
        };
        if rec.status.is_terminal() {
            tracing::debug!(pipeline_id = %rec.id, status = %rec.status, "run task on terminal pipeline, dropping");
            return Ok(());
        }

        // Fast abort path: the sweep may not have reached this node yet.
        let root = if rec.is_root_pipeline {
            rec.clone()
        } else {
            match self.store.load_pipeline(rec.root_pipeline_id).await? {
                Some(root) => root,
                None => {
                    tracing::warn!(pipeline_id = %rec.id, "root record missing, dropping run task");
                    return Ok(());
                }
            }
        };
        if root.abort_requested {
            self.abort_pipeline(&rec).await?;
            return Ok(());
        }

        if params.attempt != rec.current_attempt {
            tracing::warn!(
                pipeline_id = %rec.id,
                task_attempt = params.attempt,
                current_attempt = rec.current_attempt,
                "run task attempt mismatch, dropping"
            );
            return Ok(());
        }
        // Guard against the queue delivering a retry before its ETA.
        if params.attempt > 0 {
            if let Some(next_retry_time) = rec.next_retry_time {
                if now < next_retry_time {
                    bail!(
                        "run task for {} delivered {}ms before its retry time",
                        rec.id,
                        (next_retry_time - now).num_milliseconds()
                    );
                }
            }
        }

        let param_record = self.load_param_record(&rec).await?;
        let Some(stage) = self.registry.lookup(&rec.class_path) else {
            self.stage_failure(
                &rec,
                &param_record,
                EngineError::UnknownClassPath(rec.class_path.clone()),
            )
            .await?;
            return Ok(());
        };

        if rec.status == PipelineStatus::Run {
            // Re-delivery. A generator that committed its children but lost
            // the fanout task needs it re-sent; everything else just drops.
            if stage.kind() == StageKind::Generator {
                self.resend_fanout(&rec).await?;
            }
            return Ok(());
        }

        // Empty-blocking barriers are never notified; firing here keeps
        // trigger_time meaningful for every started stage.
        self.store
            .fire_barrier(rec.id, BarrierPurpose::Start, now)
            .await?;

        let (args, kwargs) = match self.dereference_arguments(&param_record).await? {
            Ok(resolved) => resolved,
            Err(err) => {
                self.stage_failure(&rec, &param_record, err).await?;
                return Ok(());
            }
        };

        if !self.store.record_start(rec.id, params.attempt, now).await? {
            tracing::debug!(pipeline_id = %rec.id, "lost the start race, dropping");
            return Ok(());
        }

        let outputs = StageFuture::from_existing(
            rec.class_path.clone(),
            &stage.output_names(),
            &param_record.output_slots,
        );
        let mut ctx = RunContext::new(
            rec.id,
            rec.root_pipeline_id,
            rec.current_attempt,
            rec.max_attempts,
            args,
            kwargs,
            outputs,
            Arc::clone(&self.registry),
            ChildDefaults {
                queue_name: param_record.queue_name.clone(),
                base_path: param_record.base_path.clone(),
                target: param_record.target.clone(),
                retry: param_record.retry_params(),
                task_retry: param_record.task_retry,
            },
        );

        let run_result = stage.run(&mut ctx).await;

        let commit: Result<(), StepError> = match run_result {
            Err(err) => Err(StepError::Stage(err)),
            Ok(returned) => match stage.kind() {
                StageKind::Sync => self.commit_sync(&rec, &param_record, &mut ctx, returned).await,
                StageKind::Async => self.commit_async(&rec, &param_record, &mut ctx).await,
                StageKind::Generator => self.commit_generator(&rec, &param_record, &mut ctx).await,
            },
        };

        if let Some(update) = ctx.take_status() {
            if let Err(err) = self.set_status(rec.id, update).await {
                tracing::warn!(pipeline_id = %rec.id, error = %err, "status update failed");
            }
        }

        match commit {
            Ok(()) => Ok(()),
            Err(StepError::Stage(err)) => self.stage_failure(&rec, &param_record, err).await,
            Err(StepError::Infra(err)) => Err(err),
        }
    }

    /// Slot filled: notify dependent barriers, batch by batch.
    pub async fn handle_output(&self, params: OutputTaskParams) -> Result<()> {
        let now = Utc::now();
        let Some(slot) = self.store.load_slot(params.slot_key).await? else {
            tracing::warn!(slot_key = %params.slot_key, "output task for missing slot, dropping");
            return Ok(());
        };
        if slot.status != SlotStatus::Filled {
            tracing::warn!(slot_key = %slot.id, "output task for unfilled slot, dropping");
            return Ok(());
        }

        let outcome = crate::barrier::notify_barriers(
            self.store.as_ref(),
            slot.id,
            params.cursor.as_deref(),
            self.config.notify_batch_size,
            now,
        )
        .await?;

        for (target, purpose) in outcome.fired {
            match purpose {
                BarrierPurpose::Start => {
                    let Some(target_rec) = self.store.load_pipeline(target).await? else {
                        tracing::warn!(pipeline_id = %target, "fired start barrier for missing pipeline");
                        continue;
                    };
                    self.enqueue_dropping_duplicates(
                        self.run_task(target, target_rec.current_attempt),
                    )
                    .await?;
                }
                BarrierPurpose::Finalize => {
                    self.enqueue_dropping_duplicates(self.finalized_task(target))
                        .await?;
                }
                BarrierPurpose::Abort => {
                    self.enqueue_dropping_duplicates(self.abort_task(target))
                        .await?;
                }
            }
        }

        if let Some(cursor) = outcome.continuation {
            let next_batch = params.batch + 1;
            self.enqueue_dropping_duplicates(
                Task::new(format!("{}/output", self.config.base_path))
                    .named(format!("output-{}-{}", slot.id, next_batch))
                    .param("slot_key", slot.id.to_string())
                    .param("cursor", cursor)
                    .param("batch", next_batch.to_string()),
            )
            .await?;
        }
        Ok(())
    }

    /// FINALIZE barrier fired: run the hook and move to DONE.
    pub async fn handle_finalized(&self, params: FinalizedTaskParams) -> Result<()> {
        let Some(rec) = self.store.load_pipeline(params.pipeline_key).await? else {
            tracing::warn!(pipeline_id = %params.pipeline_key, "finalized task for missing pipeline, dropping");
            return Ok(());
        };
        if rec.status.is_terminal() {
            return Ok(());
        }

        match self.load_param_record(&rec).await {
            Ok(param_record) => {
                if let Some(stage) = self.registry.lookup(&rec.class_path) {
                    let outputs = self.load_outputs(&param_record).await?;
                    let info = FinalizeInfo {
                        pipeline_id: rec.id,
                        root_pipeline_id: rec.root_pipeline_id,
                        was_aborted: false,
                        outputs,
                    };
                    stage
                        .finalized(&info)
                        .await
                        .map_err(|e| anyhow!("finalized hook failed for {}: {e}", rec.id))?;
                } else {
                    tracing::warn!(
                        pipeline_id = %rec.id,
                        class_path = %rec.class_path,
                        "finalizing pipeline with unresolvable class path"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(pipeline_id = %rec.id, error = %err, "params undecodable at finalize");
            }
        }

        if self
            .store
            .mark_finalized(rec.id, PipelineStatus::Done, Utc::now())
            .await?
        {
            tracing::debug!(pipeline_id = %rec.id, "pipeline done");
            self.maybe_schedule_cleanup(&rec).await?;
        }
        Ok(())
    }

    /// A generator committed children: enqueue runs for the unblocked ones.
    pub async fn handle_fanout(&self, params: FanoutTaskParams) -> Result<()> {
        let Some(parent) = self.store.load_pipeline(params.parent_key).await? else {
            tracing::warn!(pipeline_id = %params.parent_key, "fanout task for missing parent, dropping");
            return Ok(());
        };
        for index in params.child_indexes {
            let Some(child_id) = parent.fanned_out.get(index) else {
                tracing::warn!(pipeline_id = %parent.id, index, "fanout index out of range");
                continue;
            };
            self.enqueue_dropping_duplicates(self.run_task(*child_id, 0))
                .await?;
        }
        Ok(())
    }

    /// Root abort requested: sweep the tree in batches.
    pub async fn handle_fanout_abort(&self, params: FanoutAbortTaskParams) -> Result<()> {
        let page = self
            .store
            .list_by_root(
                params.root_pipeline_key,
                params.cursor.as_deref(),
                self.config.abort_batch_size,
            )
            .await?;

        for rec in &page.items {
            if rec.status.is_terminal() {
                continue;
            }
            self.enqueue_dropping_duplicates(self.abort_task(rec.id))
                .await?;
        }

        if let Some(cursor) = page.cursor {
            let next_batch = params.batch + 1;
            self.enqueue_dropping_duplicates(
                Task::new(format!("{}/fanout_abort", self.config.base_path))
                    .named(format!(
                        "fanout-abort-{}-{}",
                        params.root_pipeline_key, next_batch
                    ))
                    .param("root_pipeline_key", params.root_pipeline_key.to_string())
                    .param("cursor", cursor)
                    .param("batch", next_batch.to_string()),
            )
            .await?;
        }
        Ok(())
    }

    /// Per-pipeline abort delivery.
    pub async fn handle_abort(&self, params: AbortTaskParams) -> Result<()> {
        let Some(rec) = self.store.load_pipeline(params.pipeline_key).await? else {
            tracing::warn!(pipeline_id = %params.pipeline_key, "abort task for missing pipeline, dropping");
            return Ok(());
        };
        if rec.status.is_terminal() {
            return Ok(());
        }
        self.abort_pipeline(&rec).await
    }

    /// External event for an async stage.
    pub async fn handle_callback(&self, request: CallbackRequest) -> Result<CallbackOutcome> {
        let Some(rec) = self.store.load_pipeline(request.pipeline_id).await? else {
            return Ok(CallbackOutcome::NotFound);
        };
        let Some(stage) = self.registry.lookup(&rec.class_path) else {
            return Ok(CallbackOutcome::NotFound);
        };

        let allowed = match stage.callback_access() {
            CallbackAccess::Public => true,
            CallbackAccess::Internal => request.auth.from_task_queue || request.auth.is_admin,
            CallbackAccess::Admin => request.auth.is_admin,
        };
        if !allowed {
            return Ok(CallbackOutcome::Forbidden);
        }
        if stage.kind() != StageKind::Async {
            return Ok(CallbackOutcome::NotSupported);
        }
        if rec.status.is_terminal() {
            tracing::warn!(pipeline_id = %rec.id, status = %rec.status, "callback for terminal pipeline ignored");
            return Ok(CallbackOutcome::Ignored);
        }

        match stage.callback_mode() {
            CallbackMode::Plain => {}
            mode => {
                // The store's coarse operations are individually atomic but
                // there is no cross-call transaction to offer here; match
                // the original behavior of downgrading with a note.
                tracing::warn!(pipeline_id = %rec.id, ?mode, "callback transaction mode downgraded to plain");
            }
        }

        let param_record = self.load_param_record(&rec).await?;
        let future = StageFuture::from_existing(
            rec.class_path.clone(),
            &stage.output_names(),
            &param_record.output_slots,
        );
        let mut ctx = CallbackContext {
            engine: self,
            record: rec.clone(),
            params: param_record.clone(),
            request_params: request.params,
            future,
        };

        if let Err(err) = stage.callback(&mut ctx).await {
            self.stage_failure(&rec, &param_record, err).await?;
        }
        Ok(CallbackOutcome::Dispatched)
    }

    /// Root finished and cleanup was requested: delete the closure.
    pub async fn handle_cleanup(&self, params: CleanupTaskParams) -> Result<()> {
        let Some(rec) = self.store.load_pipeline(params.root_pipeline_key).await? else {
            return Ok(());
        };
        if !rec.is_root_pipeline {
            tracing::warn!(pipeline_id = %rec.id, "cleanup task for non-root pipeline, dropping");
            return Ok(());
        }
        if !rec.status.is_terminal() {
            tracing::warn!(pipeline_id = %rec.id, status = %rec.status, "cleanup before completion, dropping");
            return Ok(());
        }
        let removed = self.store.purge_root(rec.id).await?;
        tracing::info!(root_pipeline_id = %rec.id, removed, "workflow records purged");
        Ok(())
    }

    // ── Kind-specific commit paths ──

    /// Sync contract: the return value is the default output and every
    /// declared slot must be filled when the run returns.
    async fn commit_sync(
        &self,
        rec: &PipelineRecord,
        params: &ParamRecord,
        ctx: &mut RunContext,
        returned: Option<JsonValue>,
    ) -> Result<(), StepError> {
        let mut fills = ctx.take_fills();
        let filled_names = ctx.filled_names().clone();

        if !filled_names.contains(DEFAULT_OUTPUT) {
            let default_key = params
                .output_slots
                .get(DEFAULT_OUTPUT)
                .copied()
                .ok_or_else(|| anyhow!("pipeline {} has no default slot", rec.id))?;
            fills.push((
                Some(DEFAULT_OUTPUT.to_string()),
                default_key,
                returned.unwrap_or(JsonValue::Null),
            ));
        }

        let filled_keys: BTreeSet<Uuid> = fills.iter().map(|(_, key, _)| *key).collect();
        for (name, key) in &params.output_slots {
            if !filled_keys.contains(key) {
                tracing::warn!(pipeline_id = %rec.id, output = %name, "sync stage returned with unfilled output");
                return Err(StepError::Stage(EngineError::SlotNotFilled(*key)));
            }
        }

        for (_, key, value) in fills {
            self.fill_and_notify(rec.root_pipeline_id, rec.id, key, &value)
                .await?;
        }
        Ok(())
    }

    /// Async contract: buffered fills land, the stage parks in RUN, and its
    /// callback tasks go out.
    async fn commit_async(
        &self,
        rec: &PipelineRecord,
        _params: &ParamRecord,
        ctx: &mut RunContext,
    ) -> Result<(), StepError> {
        for (_, key, value) in ctx.take_fills() {
            self.fill_and_notify(rec.root_pipeline_id, rec.id, key, &value)
                .await?;
        }
        if !self.store.mark_running(rec.id, rec.current_attempt).await? {
            tracing::debug!(pipeline_id = %rec.id, "async stage lost the RUN transition, dropping callbacks");
            return Ok(());
        }
        for params in ctx.take_callback_tasks() {
            let mut task = Task::new(format!("{}/callback", self.config.base_path))
                .param("pipeline_id", rec.id.to_string());
            for (key, value) in params {
                task = task.param(key, value);
            }
            self.enqueue_dropping_duplicates(task).await?;
        }
        Ok(())
    }

    /// Generator contract: persist the drained child graph atomically, then
    /// fan out the unblocked children.
    async fn commit_generator(
        &self,
        rec: &PipelineRecord,
        params: &ParamRecord,
        ctx: &mut RunContext,
    ) -> Result<(), StepError> {
        let descriptors = ctx.take_children();
        let filled_names = ctx.filled_names().clone();

        // The last yielded child adopts the parent's unfilled outputs, so a
        // value produced deep in a recursion lands in the root's slots.
        if let Some(last) = descriptors.last() {
            let mut inheritable = params.output_slots.clone();
            inheritable.retain(|name, _| !filled_names.contains(name));
            last.future.inherit_outputs(&inheritable)?;
        }

        let (graph, runnable_indexes) = self.assemble_child_graph(rec, &descriptors).await?;

        let outcome = self
            .store
            .commit_child_graph(rec.id, rec.current_attempt, graph)
            .await?;

        // Generator self-fills target the parent's own output slots, whose
        // keys are stable across re-runs, so they commit on either path.
        for (_, key, value) in ctx.take_fills() {
            self.fill_and_notify(rec.root_pipeline_id, rec.id, key, &value)
                .await?;
        }
        if descriptors.is_empty() {
            for (name, key) in &params.output_slots {
                if !filled_names.contains(name) {
                    self.fill_and_notify(rec.root_pipeline_id, rec.id, *key, &JsonValue::Null)
                        .await?;
                }
            }
        }

        match outcome {
            CommitOutcome::Committed => {
                if !runnable_indexes.is_empty() {
                    let mut task = Task::new(format!("{}/fanout", self.config.base_path))
                        .named(format!("fanout-{}", rec.id))
                        .param("parent_key", rec.id.to_string());
                    for index in runnable_indexes {
                        task = task.param("child_indexes", index.to_string());
                    }
                    self.enqueue_dropping_duplicates(task).await?;
                }
            }
            CommitOutcome::AlreadyCommitted => {
                tracing::debug!(pipeline_id = %rec.id, "child graph already committed, re-sending fanout");
                self.resend_fanout(rec).await?;
            }
        }
        Ok(())
    }

    /// Build the transactional batch for a drained generator. Returns the
    /// indexes of children whose START barrier has no blocking slots.
    async fn assemble_child_graph(
        &self,
        rec: &PipelineRecord,
        descriptors: &[ChildDescriptor],
    ) -> Result<(ChildGraph, Vec<usize>), StepError> {
        let mut graph = ChildGraph {
            children: Vec::new(),
            slots: Vec::new(),
            barriers: Vec::new(),
            barrier_indexes: Vec::new(),
            fanned_out: Vec::new(),
        };
        let mut runnable_indexes = Vec::new();

        for (index, descriptor) in descriptors.iter().enumerate() {
            let child_params = ParamRecord {
                class_path: descriptor.class_path.clone(),
                args: descriptor.args.clone(),
                kwargs: descriptor.kwargs.clone(),
                output_slots: descriptor.future.slot_keys(),
                after_all: descriptor.after_all.clone(),
                queue_name: descriptor.queue_name.clone(),
                base_path: descriptor.base_path.clone(),
                target: descriptor.target.clone(),
                max_attempts: descriptor.retry.max_attempts,
                backoff_seconds: descriptor.retry.backoff_seconds,
                backoff_factor: descriptor.retry.backoff_factor,
                task_retry: descriptor.task_retry,
                cleanup_on_done: false,
            };
            let params_value = serde_json::to_value(&child_params)
                .map_err(|e| classify_codec(CodecError::Json(e)))?;
            let params_doc = self
                .codec
                .write_value(rec.root_pipeline_id, &params_value)
                .await
                .map_err(classify_codec)?;

            graph.children.push(PipelineRecord {
                id: descriptor.pipeline_id,
                class_path: descriptor.class_path.clone(),
                root_pipeline_id: rec.root_pipeline_id,
                is_root_pipeline: false,
                params: params_doc,
                fanned_out: Vec::new(),
                status: PipelineStatus::Waiting,
                current_attempt: 0,
                max_attempts: descriptor.retry.max_attempts,
                next_retry_time: None,
                retry_message: None,
                abort_message: None,
                abort_requested: false,
                start_time: None,
                finalized_time: None,
            });

            for slot_id in descriptor.future.owned_slot_keys() {
                graph.slots.push(SlotRecord {
                    id: slot_id,
                    root_pipeline_id: rec.root_pipeline_id,
                    filler: None,
                    value: None,
                    status: SlotStatus::Waiting,
                    fill_time: None,
                });
            }

            let start_blocking = descriptor.blocking_slots();
            if start_blocking.is_empty() {
                runnable_indexes.push(index);
            }
            for slot_id in &start_blocking {
                graph.barrier_indexes.push(BarrierIndexEntry {
                    slot_id: *slot_id,
                    target_pipeline_id: descriptor.pipeline_id,
                    purpose: BarrierPurpose::Start,
                    root_pipeline_id: rec.root_pipeline_id,
                });
            }
            graph.barriers.push(BarrierRecord {
                target_pipeline_id: descriptor.pipeline_id,
                purpose: BarrierPurpose::Start,
                root_pipeline_id: rec.root_pipeline_id,
                blocking_slots: start_blocking,
                status: BarrierStatus::Waiting,
                trigger_time: None,
            });

            let finalize_blocking: Vec<Uuid> =
                descriptor.future.slot_keys().values().copied().collect();
            for slot_id in &finalize_blocking {
                graph.barrier_indexes.push(BarrierIndexEntry {
                    slot_id: *slot_id,
                    target_pipeline_id: descriptor.pipeline_id,
                    purpose: BarrierPurpose::Finalize,
                    root_pipeline_id: rec.root_pipeline_id,
                });
            }
            graph.barriers.push(BarrierRecord {
                target_pipeline_id: descriptor.pipeline_id,
                purpose: BarrierPurpose::Finalize,
                root_pipeline_id: rec.root_pipeline_id,
                blocking_slots: finalize_blocking,
                status: BarrierStatus::Waiting,
                trigger_time: None,
            });

            graph.fanned_out.push(descriptor.pipeline_id);
        }

        Ok((graph, runnable_indexes))
    }

    /// Recompute and re-send the fanout task from the committed graph, for
    /// the crash window between commit and enqueue.
    async fn resend_fanout(&self, rec: &PipelineRecord) -> Result<()> {
        let Some(current) = self.store.load_pipeline(rec.id).await? else {
            return Ok(());
        };
        if current.fanned_out.is_empty() {
            return Ok(());
        }
        let mut runnable_indexes = Vec::new();
        for (index, child_id) in current.fanned_out.iter().enumerate() {
            let barrier = self
                .store
                .load_barrier(*child_id, BarrierPurpose::Start)
                .await?;
            if let Some(barrier) = barrier {
                if barrier.blocking_slots.is_empty() {
                    runnable_indexes.push(index);
                }
            }
        }
        if runnable_indexes.is_empty() {
            return Ok(());
        }
        let mut task = Task::new(format!("{}/fanout", self.config.base_path))
            .named(format!("fanout-{}", rec.id))
            .param("parent_key", rec.id.to_string());
        for index in runnable_indexes {
            task = task.param("child_indexes", index.to_string());
        }
        self.enqueue_dropping_duplicates(task).await
    }

    // ── Retry / abort machinery ──

    /// Route a stage-level failure: explicit aborts propagate to the root,
    /// `task_retry` stages re-raise, everything else backs off until the
    /// attempt budget is spent and then aborts the workflow.
    async fn stage_failure(
        &self,
        rec: &PipelineRecord,
        params: &ParamRecord,
        err: EngineError,
    ) -> Result<()> {
        if let EngineError::Abort(message) = &err {
            tracing::warn!(pipeline_id = %rec.id, message = %message, "stage requested abort");
            return self
                .begin_root_abort(rec.root_pipeline_id, Some(message))
                .await;
        }

        let message = err.to_string();
        if params.task_retry {
            bail!("stage {} failed (task_retry): {message}", rec.id);
        }
        self.schedule_retry(rec, params, &message).await
    }

    /// Apply backoff and enqueue the next attempt, or abort the workflow
    /// when attempts are exhausted.
    async fn schedule_retry(
        &self,
        rec: &PipelineRecord,
        params: &ParamRecord,
        message: &str,
    ) -> Result<()> {
        if rec.current_attempt + 1 >= rec.max_attempts {
            tracing::warn!(
                pipeline_id = %rec.id,
                attempts = rec.max_attempts,
                message = %message,
                "attempts exhausted, aborting workflow"
            );
            return self
                .begin_root_abort(rec.root_pipeline_id, Some(message))
                .await;
        }

        let delay_seconds =
            params.backoff_seconds * params.backoff_factor.powi(rec.current_attempt as i32);
        let next_retry_time = Utc::now() + Duration::milliseconds((delay_seconds * 1000.0) as i64);
        let next_attempt = rec.current_attempt + 1;

        if !self
            .store
            .apply_retry(rec.id, rec.current_attempt, next_retry_time, message)
            .await?
        {
            tracing::debug!(pipeline_id = %rec.id, "retry transition lost, dropping");
            return Ok(());
        }
        tracing::info!(
            pipeline_id = %rec.id,
            attempt = next_attempt,
            delay_seconds,
            message = %message,
            "stage retry scheduled"
        );
        self.enqueue_dropping_duplicates(self.run_task(rec.id, next_attempt).eta(next_retry_time))
            .await
    }

    /// Set the root abort flag and kick off the fan-out sweep.
    async fn begin_root_abort(&self, root_pipeline_id: Uuid, message: Option<&str>) -> Result<()> {
        if !self.store.request_abort(root_pipeline_id, message).await? {
            tracing::debug!(root_pipeline_id = %root_pipeline_id, "abort already requested");
            return Ok(());
        }
        tracing::warn!(root_pipeline_id = %root_pipeline_id, message = ?message, "workflow abort requested");
        self.enqueue_dropping_duplicates(
            Task::new(format!("{}/fanout_abort", self.config.base_path))
                .named(format!("fanout-abort-{root_pipeline_id}-0"))
                .param("root_pipeline_key", root_pipeline_id.to_string())
                .param("batch", "0".to_string()),
        )
        .await
    }

    /// Move one pipeline to ABORTED if its kind allows, then run the
    /// finalize hook with `was_aborted`.
    async fn abort_pipeline(&self, rec: &PipelineRecord) -> Result<()> {
        let stage = self.registry.lookup(&rec.class_path);
        if let Some(stage) = &stage {
            if stage.kind() == StageKind::Async
                && rec.status == PipelineStatus::Run
                && !stage.try_cancel()
            {
                // Abort has no effect until the stage completes normally.
                tracing::debug!(pipeline_id = %rec.id, "async stage declined cancellation");
                return Ok(());
            }
        }

        if !self
            .store
            .mark_finalized(rec.id, PipelineStatus::Aborted, Utc::now())
            .await?
        {
            return Ok(());
        }
        tracing::info!(pipeline_id = %rec.id, "pipeline aborted");

        if let Some(stage) = stage {
            match self.load_param_record(rec).await {
                Ok(param_record) => {
                    let outputs = self.load_outputs(&param_record).await?;
                    let info = FinalizeInfo {
                        pipeline_id: rec.id,
                        root_pipeline_id: rec.root_pipeline_id,
                        was_aborted: true,
                        outputs,
                    };
                    if let Err(err) = stage.finalized(&info).await {
                        tracing::warn!(pipeline_id = %rec.id, error = %err, "finalized hook failed during abort");
                    }
                }
                Err(err) => {
                    tracing::warn!(pipeline_id = %rec.id, error = %err, "params undecodable during abort");
                }
            }
        }
        self.maybe_schedule_cleanup(rec).await
    }

    // ── Shared helpers ──

    async fn maybe_schedule_cleanup(&self, rec: &PipelineRecord) -> Result<()> {
        if !rec.is_root_pipeline {
            return Ok(());
        }
        match self.load_param_record(rec).await {
            Ok(params) if params.cleanup_on_done => self.cleanup(rec.id).await,
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!(pipeline_id = %rec.id, error = %err, "params undecodable, skipping cleanup check");
                Ok(())
            }
        }
    }

    pub(crate) async fn load_param_record(&self, rec: &PipelineRecord) -> Result<ParamRecord> {
        let value = self
            .codec
            .read_value(&rec.params)
            .await
            .with_context(|| format!("reading params for pipeline {}", rec.id))?;
        Ok(serde_json::from_value(value)
            .with_context(|| format!("decoding params for pipeline {}", rec.id))?)
    }

    /// Resolve `{value|slot}` argument leaves. Missing slot records are
    /// fatal; unfilled slots are a stage failure (the barrier should have
    /// prevented this).
    async fn dereference_arguments(
        &self,
        params: &ParamRecord,
    ) -> Result<Result<(Vec<JsonValue>, BTreeMap<String, JsonValue>), EngineError>> {
        let slot_keys: Vec<Uuid> = params
            .args
            .iter()
            .chain(params.kwargs.values())
            .filter_map(ArgumentRef::slot_key)
            .collect();
        let records = self.store.load_slots(&slot_keys).await?;

        let mut loaded: BTreeMap<Uuid, SlotRecord> = BTreeMap::new();
        for (key, record) in slot_keys.iter().zip(records) {
            match record {
                Some(record) => {
                    loaded.insert(*key, record);
                }
                None => bail!("argument slot {key} disappeared"),
            }
        }

        let mut args = Vec::with_capacity(params.args.len());
        for arg in &params.args {
            match self.resolve_argument(arg, &loaded).await? {
                Ok(value) => args.push(value),
                Err(err) => return Ok(Err(err)),
            }
        }
        let mut kwargs = BTreeMap::new();
        for (name, arg) in &params.kwargs {
            match self.resolve_argument(arg, &loaded).await? {
                Ok(value) => {
                    kwargs.insert(name.clone(), value);
                }
                Err(err) => return Ok(Err(err)),
            }
        }
        Ok(Ok((args, kwargs)))
    }

    async fn resolve_argument(
        &self,
        arg: &ArgumentRef,
        loaded: &BTreeMap<Uuid, SlotRecord>,
    ) -> Result<Result<JsonValue, EngineError>> {
        match arg {
            ArgumentRef::Value { value } => Ok(Ok(value.clone())),
            ArgumentRef::Slot { slot_key } => {
                let record = &loaded[slot_key];
                if record.status != SlotStatus::Filled {
                    return Ok(Err(EngineError::SlotNotFilled(*slot_key)));
                }
                let doc = record
                    .value
                    .as_ref()
                    .ok_or_else(|| anyhow!("filled slot {slot_key} has no value document"))?;
                Ok(Ok(self.codec.read_value(doc).await?))
            }
        }
    }

    /// Serialize, fill, and kick the notify machinery for one slot.
    async fn fill_and_notify(
        &self,
        root_pipeline_id: Uuid,
        filler: Uuid,
        slot_key: Uuid,
        value: &JsonValue,
    ) -> Result<(), StepError> {
        let doc = self
            .codec
            .write_value(root_pipeline_id, value)
            .await
            .map_err(classify_codec)?;
        let outcome = self
            .store
            .fill_slot(slot_key, root_pipeline_id, filler, doc, Utc::now())
            .await
            .map_err(StepError::Infra)?;
        if outcome == FillOutcome::Created {
            tracing::debug!(slot_key = %slot_key, "slot record created on first fill");
        }
        self.enqueue_dropping_duplicates(
            Task::new(format!("{}/output", self.config.base_path))
                .param("slot_key", slot_key.to_string()),
        )
        .await
        .map_err(StepError::Infra)?;
        Ok(())
    }

    /// Load a pipeline's outputs as read handles, decoding filled values.
    pub(crate) async fn load_outputs(&self, params: &ParamRecord) -> Result<Outputs> {
        let keys: Vec<Uuid> = params.output_slots.values().copied().collect();
        let records = self.store.load_slots(&keys).await?;
        let by_key: BTreeMap<Uuid, SlotRecord> = keys
            .iter()
            .zip(records)
            .filter_map(|(key, record)| record.map(|r| (*key, r)))
            .collect();

        let mut slots = BTreeMap::new();
        for (name, key) in &params.output_slots {
            let slot = match by_key.get(key) {
                Some(record) => {
                    let value = match &record.value {
                        Some(doc) => Some(self.codec.read_value(doc).await?),
                        None => None,
                    };
                    Slot::from_record(record, value)
                }
                None => Slot::unfilled(*key),
            };
            slots.insert(name.clone(), slot);
        }
        Ok(Outputs::new(slots))
    }

    /// Enqueue, treating a tombstoned name as success.
    async fn enqueue_dropping_duplicates(&self, task: Task) -> Result<()> {
        match self.queue.enqueue(task).await {
            Ok(()) => Ok(()),
            Err(QueueError::TaskAlreadyExists(name)) => {
                tracing::debug!(task_name = %name, "duplicate task dropped");
                Ok(())
            }
            Err(QueueError::Backend(err)) => bail!("task queue: {err}"),
        }
    }

    fn run_task(&self, pipeline_id: Uuid, attempt: u32) -> Task {
        Task::new(format!("{}/run", self.config.base_path))
            .named(format!("run-{pipeline_id}-{attempt}"))
            .param("pipeline_key", pipeline_id.to_string())
            .param("purpose", BarrierPurpose::Start.to_string())
            .param("attempt", attempt.to_string())
    }

    fn finalized_task(&self, pipeline_id: Uuid) -> Task {
        Task::new(format!("{}/finalized", self.config.base_path))
            .named(format!("finalized-{pipeline_id}"))
            .param("pipeline_key", pipeline_id.to_string())
            .param("purpose", BarrierPurpose::Finalize.to_string())
    }

    fn abort_task(&self, pipeline_id: Uuid) -> Task {
        Task::new(format!("{}/abort", self.config.base_path))
            .named(format!("abort-{pipeline_id}"))
            .param("pipeline_key", pipeline_id.to_string())
            .param("purpose", BarrierPurpose::Abort.to_string())
    }
}

fn parse_uuid_param(task: &Task, key: &str) -> Result<Uuid> {
    let raw = task
        .get_param(key)
        .ok_or_else(|| anyhow!("task missing parameter '{key}'"))?;
    Uuid::parse_str(raw).with_context(|| format!("bad uuid in '{key}'"))
}

fn parse_int_param(task: &Task, key: &str) -> Result<Option<i64>> {
    match task.get_param(key) {
        None => Ok(None),
        Some(raw) => Ok(Some(
            raw.parse::<i64>()
                .with_context(|| format!("bad integer in '{key}'"))?,
        )),
    }
}
