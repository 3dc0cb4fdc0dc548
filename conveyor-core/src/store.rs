use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::*;

/// One page of a cursored listing. The cursor is an opaque backend token;
/// feeding it back resumes the scan after the last returned item.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

/// All records created when a root pipeline starts, persisted atomically.
#[derive(Clone, Debug)]
pub struct RootGraph {
    pub pipeline: PipelineRecord,
    pub slots: Vec<SlotRecord>,
    pub barriers: Vec<BarrierRecord>,
    pub barrier_indexes: Vec<BarrierIndexEntry>,
}

/// All records produced by draining one generator, persisted atomically
/// together with the parent's `fanned_out` list and WAITING → RUN move.
#[derive(Clone, Debug)]
pub struct ChildGraph {
    pub children: Vec<PipelineRecord>,
    pub slots: Vec<SlotRecord>,
    pub barriers: Vec<BarrierRecord>,
    pub barrier_indexes: Vec<BarrierIndexEntry>,
    /// Child ids in yield order; becomes the parent's `fanned_out`.
    pub fanned_out: Vec<Uuid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The parent already fanned out (generator re-run); the stored graph
    /// wins and the new one is discarded.
    AlreadyCommitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillOutcome {
    Filled,
    /// The slot was already FILLED; value and fill_time were overwritten,
    /// status and filler were left alone.
    Refilled,
    /// No record existed: the slot was a named reference only and was
    /// persisted on first fill.
    Created,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    Fired,
    AlreadyFired,
    Missing,
}

/// Persistence trait for all engine state.
///
/// Methods are grouped by concern. Anything that §5 requires to be atomic is
/// a single coarse operation here (`create_root`, `commit_child_graph`,
/// `fill_slot`, `fire_barrier`, `apply_retry`, `purge_root`) so each backend
/// implements it with its own transaction primitive. Guarded transitions
/// return `false` when the guard fails, which handlers treat as an
/// idempotent no-op.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Pipelines ──

    async fn save_pipeline(&self, record: &PipelineRecord) -> Result<()>;
    async fn load_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>>;

    /// Root pipelines only, newest first, optionally filtered by class path.
    async fn list_roots(
        &self,
        class_path: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>>;

    /// Every pipeline under a root (the root itself included), in id order.
    async fn list_by_root(
        &self,
        root_pipeline_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>>;

    // ── Guarded transitions ──

    /// Persist a whole root graph. Returns `false` without writing anything
    /// when a pipeline with this id already exists.
    async fn create_root(&self, graph: RootGraph) -> Result<bool>;

    /// Record the first execution of an attempt: sets `start_time` if unset.
    /// Guard: status WAITING and matching attempt.
    async fn record_start(&self, id: Uuid, attempt: u32, time: DateTime<Utc>) -> Result<bool>;

    /// WAITING → RUN for async stages awaiting their callback.
    /// Guard: status WAITING and matching attempt.
    async fn mark_running(&self, id: Uuid, attempt: u32) -> Result<bool>;

    /// Persist a generator's child graph and move the parent WAITING → RUN
    /// in one transaction. Guard: parent status WAITING and matching
    /// attempt; a parent already in RUN short-circuits.
    async fn commit_child_graph(
        &self,
        parent_id: Uuid,
        attempt: u32,
        graph: ChildGraph,
    ) -> Result<CommitOutcome>;

    /// WAITING or RUN → DONE or ABORTED, setting `finalized_time`.
    async fn mark_finalized(
        &self,
        id: Uuid,
        status: PipelineStatus,
        time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Increment the attempt counter and schedule the next try.
    /// Guard: `current_attempt == expected_attempt` and non-terminal status;
    /// resets the status to WAITING.
    async fn apply_retry(
        &self,
        id: Uuid,
        expected_attempt: u32,
        next_retry_time: DateTime<Utc>,
        retry_message: &str,
    ) -> Result<bool>;

    /// Set `abort_requested` (and the message) on a root pipeline.
    /// Returns `false` if the abort was already requested or the record is
    /// not a root.
    async fn request_abort(&self, root_pipeline_id: Uuid, message: Option<&str>) -> Result<bool>;

    // ── Slots ──

    async fn load_slot(&self, id: Uuid) -> Result<Option<SlotRecord>>;
    async fn load_slots(&self, ids: &[Uuid]) -> Result<Vec<Option<SlotRecord>>>;
    async fn list_slots_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<SlotRecord>>;

    /// Compare-and-set WAITING → FILLED. A re-fill overwrites the value and
    /// fill_time but never the status or the original filler. Filling a slot
    /// with no record persists it on the spot.
    async fn fill_slot(
        &self,
        id: Uuid,
        root_pipeline_id: Uuid,
        filler: Uuid,
        value: ValueDocument,
        time: DateTime<Utc>,
    ) -> Result<FillOutcome>;

    // ── Barriers ──

    async fn load_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
    ) -> Result<Option<BarrierRecord>>;
    async fn list_barriers_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<BarrierRecord>>;

    /// Compare-and-set WAITING → FIRED; `trigger_time` is written exactly
    /// once.
    async fn fire_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
        time: DateTime<Utc>,
    ) -> Result<FireOutcome>;

    /// Index entries for barriers blocked on a slot, in stable key order.
    async fn list_barrier_indexes(
        &self,
        slot_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<BarrierIndexEntry>>;

    // ── Status records ──

    async fn save_status_record(&self, record: &StatusRecord) -> Result<()>;
    async fn load_status_record(&self, pipeline_id: Uuid) -> Result<Option<StatusRecord>>;
    async fn list_status_records_by_root(
        &self,
        root_pipeline_id: Uuid,
    ) -> Result<Vec<StatusRecord>>;

    // ── Cleanup ──

    /// Delete every pipeline, slot, barrier, barrier index and status record
    /// under a root. Returns the number of records removed.
    async fn purge_root(&self, root_pipeline_id: Uuid) -> Result<u64>;
}
