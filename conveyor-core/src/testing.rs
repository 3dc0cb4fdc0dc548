//! Task-driven test harness.
//!
//! Mirrors production execution on in-memory backends: start a pipeline,
//! then repeatedly pull due tasks from the queue and run them against the
//! handlers until the queue is quiet. Each batch is shuffled so tests
//! exercise out-of-order delivery, and ETAs are honored by sleeping.

use rand::seq::SliceRandom;
use std::sync::Arc;
use uuid::Uuid;

use crate::blob::MemoryBlobStore;
use crate::engine::{Engine, StartOptions};
use crate::queue::MemoryTaskQueue;
use crate::slot::Outputs;
use crate::stage::{StageCall, StageRegistry};
use crate::store::RecordStore;
use crate::store_memory::MemoryStore;
use crate::types::{BarrierStatus, PipelineStatus, SlotStatus};

/// Backstop against a stalled workflow spinning the drain loop forever.
const MAX_TASKS: usize = 10_000;

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub blobs: Arc<MemoryBlobStore>,
    pub registry: Arc<StageRegistry>,
    pub engine: Arc<Engine>,
}

impl TestHarness {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = Arc::new(Engine::new(
            store.clone(),
            queue.clone(),
            blobs.clone(),
            registry.clone(),
        ));
        Self {
            store,
            queue,
            blobs,
            registry,
            engine,
        }
    }

    /// Start a pipeline, drive it to quiescence, assert every record
    /// reached its happy-path terminal state, and return the root outputs.
    pub async fn run_pipeline(&self, call: StageCall) -> Outputs {
        self.run_pipeline_with(call, StartOptions::default(), true)
            .await
    }

    /// As `run_pipeline`, with start options and an opt-out of the
    /// all-records-finished assertion (abort scenarios leave WAITING
    /// records behind by design).
    pub async fn run_pipeline_with(
        &self,
        call: StageCall,
        opts: StartOptions,
        require_finished: bool,
    ) -> Outputs {
        let root_id = self
            .engine
            .start(call, opts)
            .await
            .expect("pipeline start failed");
        self.drain().await;
        if require_finished {
            self.assert_finished(root_id).await;
        }
        self.outputs(root_id).await
    }

    /// Pull and execute tasks until the queue is empty, sleeping through
    /// retry ETAs. Handler errors fail the test.
    pub async fn drain(&self) {
        let mut executed = 0usize;
        loop {
            let mut batch = self.queue.take_due(chrono::Utc::now()).await;
            if batch.is_empty() {
                let Some(eta) = self.queue.next_eta().await else {
                    return;
                };
                let wait = (eta - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait + std::time::Duration::from_millis(5)).await;
                continue;
            }

            batch.shuffle(&mut rand::rng());
            for task in batch {
                executed += 1;
                assert!(executed <= MAX_TASKS, "task budget exhausted; workflow stalled?");
                self.engine
                    .dispatch_task(&task)
                    .await
                    .unwrap_or_else(|err| panic!("task {} failed: {err:#}", task.path));
            }
        }
    }

    /// Happy-path quiescence: every slot FILLED, every barrier FIRED,
    /// every pipeline DONE.
    pub async fn assert_finished(&self, root_id: Uuid) {
        for slot in self.store.list_slots_by_root(root_id).await.unwrap() {
            assert_eq!(
                slot.status,
                SlotStatus::Filled,
                "slot {} still waiting",
                slot.id
            );
        }
        for barrier in self.store.list_barriers_by_root(root_id).await.unwrap() {
            assert_eq!(
                barrier.status,
                BarrierStatus::Fired,
                "barrier ({}, {}) never fired",
                barrier.target_pipeline_id,
                barrier.purpose
            );
        }
        let mut cursor = None;
        loop {
            let page = self
                .store
                .list_by_root(root_id, cursor.as_deref(), 100)
                .await
                .unwrap();
            for rec in &page.items {
                assert_eq!(
                    rec.status,
                    PipelineStatus::Done,
                    "pipeline {} ({}) not done",
                    rec.id,
                    rec.class_path
                );
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }

    /// The root pipeline's outputs, decoded.
    pub async fn outputs(&self, root_id: Uuid) -> Outputs {
        let rec = self
            .store
            .load_pipeline(root_id)
            .await
            .unwrap()
            .expect("root record missing");
        let params = self
            .engine
            .load_param_record(&rec)
            .await
            .expect("root params undecodable");
        self.engine.load_outputs(&params).await.unwrap()
    }
}
