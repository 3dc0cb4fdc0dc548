//! Loopback task queue for single-process deployments.
//!
//! Production deployments point the engine at a real push queue that POSTs
//! back to the HTTP endpoints. This queue instead dispatches tasks to the
//! engine in-process from a spawned tokio task, honoring ETAs and task-name
//! tombstones, with a small fixed retry loop standing in for the queue's
//! own redelivery.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use conveyor_core::engine::Engine;
use conveyor_core::queue::{QueueError, Task, TaskQueue};

const DISPATCH_ATTEMPTS: u32 = 5;
const DISPATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct LoopbackQueue {
    engine: OnceLock<Arc<Engine>>,
    tombstones: tokio::sync::Mutex<HashSet<String>>,
}

impl LoopbackQueue {
    pub fn new() -> Self {
        Self {
            engine: OnceLock::new(),
            tombstones: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Wire the engine in after construction; the engine itself owns the
    /// queue handle, so binding breaks the construction cycle.
    pub fn bind(&self, engine: Arc<Engine>) {
        if self.engine.set(engine).is_err() {
            tracing::warn!("loopback queue bound twice, keeping the first engine");
        }
    }
}

impl Default for LoopbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for LoopbackQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if let Some(name) = &task.name {
            let mut tombstones = self.tombstones.lock().await;
            if !tombstones.insert(name.clone()) {
                return Err(QueueError::TaskAlreadyExists(name.clone()));
            }
        }

        let engine = self
            .engine
            .get()
            .cloned()
            .ok_or_else(|| QueueError::Backend("loopback queue not bound".to_string()))?;

        tokio::spawn(async move {
            if let Some(eta) = task.eta {
                if let Ok(wait) = (eta - chrono::Utc::now()).to_std() {
                    tokio::time::sleep(wait).await;
                }
            }
            for attempt in 1..=DISPATCH_ATTEMPTS {
                match engine.dispatch_task(&task).await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(
                            path = %task.path,
                            attempt,
                            error = %format!("{err:#}"),
                            "task dispatch failed"
                        );
                        tokio::time::sleep(DISPATCH_RETRY_DELAY).await;
                    }
                }
            }
            tracing::error!(path = %task.path, "task dropped after {DISPATCH_ATTEMPTS} attempts");
        });
        Ok(())
    }
}
