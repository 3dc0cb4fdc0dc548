//! Stage contracts and the class-path registry.
//!
//! A stage class is registered under a dotted class path at process start;
//! records persist only the path. Three kinds exist:
//!
//! - **Sync**: `run` returns a value for the default slot (named outputs via
//!   `fill`); every declared slot must be FILLED when it returns.
//! - **Async**: `run` starts external work and the stage parks in RUN until
//!   a callback calls `complete` (or `retry`/`abort`).
//! - **Generator**: `run` yields child stages through the context; the
//!   drain is pure and the whole child graph commits in one transaction.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::builder::{ChildDefaults, ChildDescriptor, ChildGraphBuilder};
use crate::engine::CallbackContext;
use crate::error::EngineError;
use crate::future::{SlotHandle, StageFuture};
use crate::slot::Outputs;
use crate::types::{RetryParams, StatusLink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Sync,
    Async,
    Generator,
}

/// Who may invoke an async stage's callback endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAccess {
    /// Only the task queue (origin header required). The default.
    Internal,
    /// Anyone.
    Public,
    /// Only admin-gated requests (gating is done by the fronting proxy).
    Admin,
}

/// Transaction wrapping for callback dispatch. `Plain` is the default to
/// avoid write amplification on every external event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackMode {
    Plain,
    Transaction,
    CrossGroupTransaction,
}

/// Hook payload for `finalized`.
pub struct FinalizeInfo {
    pub pipeline_id: Uuid,
    pub root_pipeline_id: Uuid,
    pub was_aborted: bool,
    pub outputs: Outputs,
}

/// One registered stage class.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind {
        StageKind::Sync
    }

    /// Declared named outputs. Non-empty makes the stage's future strict.
    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn callback_access(&self) -> CallbackAccess {
        CallbackAccess::Internal
    }

    fn callback_mode(&self) -> CallbackMode {
        CallbackMode::Plain
    }

    /// The stage body. Sync stages return the default-slot value; async and
    /// generator stages return `None`.
    async fn run(&self, ctx: &mut RunContext) -> Result<Option<JsonValue>, EngineError>;

    /// External-event entry point for async stages.
    async fn callback(&self, ctx: &mut CallbackContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Err(EngineError::other("stage does not accept callbacks"))
    }

    /// Post-completion hook, called once per stage.
    async fn finalized(&self, info: &FinalizeInfo) -> Result<(), EngineError> {
        let _ = info;
        Ok(())
    }

    /// Consulted when an abort reaches a RUN async stage. Returning false
    /// leaves the stage running until it completes normally.
    fn try_cancel(&self) -> bool {
        false
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// Maps dotted class paths to stage implementations. Populated at process
/// start; records carry only the path.
pub struct StageRegistry {
    inner: RwLock<BTreeMap<String, Arc<dyn Stage>>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, class_path: impl Into<String>, stage: Arc<dyn Stage>) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(class_path.into(), stage);
    }

    pub fn lookup(&self, class_path: &str) -> Option<Arc<dyn Stage>> {
        let inner = self.inner.read().unwrap();
        inner.get(class_path).cloned()
    }

    pub fn class_paths(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.keys().cloned().collect()
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Stage calls ──────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) enum CallArg {
    Value(JsonValue),
    Slot(Uuid),
}

/// Description of one stage instantiation: class path, arguments, and
/// overrides for retry and routing knobs.
#[derive(Clone, Debug)]
pub struct StageCall {
    pub(crate) class_path: String,
    pub(crate) args: Vec<CallArg>,
    pub(crate) kwargs: BTreeMap<String, CallArg>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) backoff_seconds: Option<f64>,
    pub(crate) backoff_factor: Option<f64>,
    pub(crate) queue_name: Option<String>,
    pub(crate) target: Option<String>,
    pub(crate) task_retry: Option<bool>,
}

impl StageCall {
    pub fn new(class_path: impl Into<String>) -> Self {
        Self {
            class_path: class_path.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            max_attempts: None,
            backoff_seconds: None,
            backoff_factor: None,
            queue_name: None,
            target: None,
            task_retry: None,
        }
    }

    pub fn arg(mut self, value: impl Into<JsonValue>) -> Self {
        self.args.push(CallArg::Value(value.into()));
        self
    }

    pub fn arg_slot(mut self, slot: &SlotHandle) -> Self {
        self.args.push(CallArg::Slot(slot.key()));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.kwargs.insert(name.into(), CallArg::Value(value.into()));
        self
    }

    pub fn kwarg_slot(mut self, name: impl Into<String>, slot: &SlotHandle) -> Self {
        self.kwargs.insert(name.into(), CallArg::Slot(slot.key()));
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn backoff_seconds(mut self, backoff_seconds: f64) -> Self {
        self.backoff_seconds = Some(backoff_seconds);
        self
    }

    pub fn backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = Some(backoff_factor);
        self
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn task_retry(mut self, task_retry: bool) -> Self {
        self.task_retry = Some(task_retry);
        self
    }

    pub fn class_path(&self) -> &str {
        &self.class_path
    }

    pub(crate) fn retry_params(&self, defaults: RetryParams) -> RetryParams {
        RetryParams {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_seconds: self.backoff_seconds.unwrap_or(defaults.backoff_seconds),
            backoff_factor: self.backoff_factor.unwrap_or(defaults.backoff_factor),
        }
    }
}

// ─── Run context ──────────────────────────────────────────────

/// Buffered status update written after the run commits.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub message: Option<String>,
    pub console_url: Option<String>,
    pub links: Vec<StatusLink>,
}

/// Everything a stage body can see and do during `run`.
///
/// All effects are buffered: the drain itself performs no I/O, and the
/// engine commits fills, children, callback tasks and status after `run`
/// returns. That is what makes generator re-runs safe to discard.
pub struct RunContext {
    pipeline_id: Uuid,
    root_pipeline_id: Uuid,
    attempt: u32,
    max_attempts: u32,
    args: Vec<JsonValue>,
    kwargs: BTreeMap<String, JsonValue>,
    outputs: StageFuture,
    registry: Arc<StageRegistry>,
    builder: ChildGraphBuilder,
    fills: Vec<(Option<String>, Uuid, JsonValue)>,
    filled_names: BTreeSet<String>,
    callback_tasks: Vec<Vec<(String, String)>>,
    status: Option<StatusUpdate>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pipeline_id: Uuid,
        root_pipeline_id: Uuid,
        attempt: u32,
        max_attempts: u32,
        args: Vec<JsonValue>,
        kwargs: BTreeMap<String, JsonValue>,
        outputs: StageFuture,
        registry: Arc<StageRegistry>,
        defaults: ChildDefaults,
    ) -> Self {
        Self {
            pipeline_id,
            root_pipeline_id,
            attempt,
            max_attempts,
            args,
            kwargs,
            outputs,
            registry,
            builder: ChildGraphBuilder::new(defaults),
            fills: Vec::new(),
            filled_names: BTreeSet::new(),
            callback_tasks: Vec::new(),
            status: None,
        }
    }

    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    pub fn root_pipeline_id(&self) -> Uuid {
        self.root_pipeline_id
    }

    /// Zero-based attempt currently executing.
    pub fn current_attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn args(&self) -> &[JsonValue] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&JsonValue> {
        self.args.get(index)
    }

    pub fn kwargs(&self) -> &BTreeMap<String, JsonValue> {
        &self.kwargs
    }

    pub fn kwarg(&self, name: &str) -> Option<&JsonValue> {
        self.kwargs.get(name)
    }

    /// This stage's own output slots.
    pub fn outputs(&self) -> &StageFuture {
        &self.outputs
    }

    /// Fill a named output. The write happens when the run commits.
    pub fn fill(&mut self, name: &str, value: JsonValue) -> Result<(), EngineError> {
        let handle = self.outputs.output(name)?;
        self.filled_names.insert(name.to_string());
        self.fills
            .push((Some(name.to_string()), handle.key(), value));
        Ok(())
    }

    /// Fill a slot by handle (one of this stage's own outputs, typically
    /// obtained from `outputs()`).
    pub fn fill_slot(&mut self, slot: &SlotHandle, value: JsonValue) {
        let name = self
            .outputs
            .slot_keys()
            .into_iter()
            .find(|(_, key)| *key == slot.key())
            .map(|(name, _)| name);
        if let Some(name) = &name {
            self.filled_names.insert(name.clone());
        }
        self.fills.push((name, slot.key(), value));
    }

    /// Yield a child stage. Generator kind only; the returned future lets
    /// later children consume this child's outputs.
    pub fn spawn(&mut self, call: StageCall) -> Result<StageFuture, EngineError> {
        let stage = self
            .registry
            .lookup(&call.class_path)
            .ok_or_else(|| EngineError::UnknownClassPath(call.class_path.clone()))?;
        self.builder.spawn(call, stage.output_names())
    }

    /// Run `body` with the default slots of `deps` added to the START
    /// barrier of every child yielded inside it.
    pub fn after<F>(&mut self, deps: &[&StageFuture], body: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut RunContext) -> Result<(), EngineError>,
    {
        let keys: Vec<Uuid> = deps.iter().map(|f| f.default_output().key()).collect();
        self.builder.push_after(keys);
        let result = body(self);
        self.builder.pop_after();
        result
    }

    /// Run `body` with each yielded child blocked on the previous one's
    /// default slot. InOrder scopes cannot nest.
    pub fn in_order<F>(&mut self, body: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut RunContext) -> Result<(), EngineError>,
    {
        self.builder.enter_in_order()?;
        let result = body(self);
        self.builder.exit_in_order();
        result
    }

    /// Request the callback task for this async stage; enqueued when the
    /// run commits. `pipeline_id` is added automatically.
    pub fn enqueue_callback(&mut self, params: Vec<(String, String)>) {
        self.callback_tasks.push(params);
    }

    /// Record an advisory status message for the UI.
    pub fn set_status(&mut self, update: StatusUpdate) {
        self.status = Some(update);
    }

    // ── Engine-side accessors ──

    pub(crate) fn take_fills(&mut self) -> Vec<(Option<String>, Uuid, JsonValue)> {
        std::mem::take(&mut self.fills)
    }

    pub(crate) fn filled_names(&self) -> &BTreeSet<String> {
        &self.filled_names
    }

    pub(crate) fn take_children(&mut self) -> Vec<ChildDescriptor> {
        self.builder.take_children()
    }

    pub(crate) fn take_callback_tasks(&mut self) -> Vec<Vec<(String, String)>> {
        std::mem::take(&mut self.callback_tasks)
    }

    pub(crate) fn take_status(&mut self) -> Option<StatusUpdate> {
        self.status.take()
    }
}
