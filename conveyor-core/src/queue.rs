//! Task queue contract.
//!
//! The engine never runs work in-process: every state transition is a named
//! HTTP POST executed later by an external at-least-once queue. This module
//! defines the task shape, the enqueue trait, and an in-memory queue with
//! name tombstones used by the test harness and the dev server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// A named HTTP POST with a form-encoded body.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    /// Deduplication name; `None` means the queue accepts duplicates.
    pub name: Option<String>,
    /// Absolute path under the service host, e.g. `/_ah/pipeline/run`.
    pub path: String,
    /// Form parameters; repeated keys are allowed.
    pub params: Vec<(String, String)>,
    /// Earliest execution time; `None` means as soon as possible.
    pub eta: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            name: None,
            path: path.into(),
            params: Vec::new(),
            eta: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// First value for a form key.
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeated form key.
    pub fn get_params(&self, key: &str) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The task name was already used; queues tombstone names so duplicate
    /// enqueues of a deterministic name are dropped.
    #[error("task name already enqueued: {0}")]
    TaskAlreadyExists(String),

    #[error("queue backend: {0}")]
    Backend(String),
}

/// Enqueue-only view of the task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;
}

// ─── Memory queue ─────────────────────────────────────────────

struct Inner {
    pending: VecDeque<Task>,
    /// Names that were ever accepted. Tombstones outlive execution, which is
    /// what makes deterministic task names a deduplication mechanism.
    tombstones: HashSet<String>,
}

/// In-memory queue for tests and the dev server.
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                tombstones: HashSet::new(),
            }),
        }
    }

    /// Remove and return every task whose ETA has passed.
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut inner = self.inner.lock().await;
        let mut due = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(task) = inner.pending.pop_front() {
            match task.eta {
                Some(eta) if eta > now => remaining.push_back(task),
                _ => due.push(task),
            }
        }
        inner.pending = remaining;
        due
    }

    /// Earliest ETA among still-pending tasks.
    pub async fn next_eta(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner.pending.iter().filter_map(|t| t.eta).min()
    }

    pub async fn pending_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.pending.len()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(name) = &task.name {
            if !inner.tombstones.insert(name.clone()) {
                return Err(QueueError::TaskAlreadyExists(name.clone()));
            }
        }
        inner.pending.push_back(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_named_tasks_are_deduplicated() {
        let queue = MemoryTaskQueue::new();
        let task = Task::new("/_ah/pipeline/run")
            .named("run-abc-0")
            .param("pipeline_key", "abc");

        queue.enqueue(task.clone()).await.unwrap();
        let err = queue.enqueue(task).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskAlreadyExists(_)));

        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_tombstones_survive_execution() {
        let queue = MemoryTaskQueue::new();
        let task = Task::new("/_ah/pipeline/run").named("run-abc-0");
        queue.enqueue(task.clone()).await.unwrap();

        let due = queue.take_due(Utc::now()).await;
        assert_eq!(due.len(), 1);

        // Re-enqueue after execution is still a duplicate.
        assert!(queue.enqueue(task).await.is_err());
    }

    #[tokio::test]
    async fn test_eta_holds_tasks_back() {
        let queue = MemoryTaskQueue::new();
        let now = Utc::now();
        queue
            .enqueue(Task::new("/a").eta(now + Duration::seconds(30)))
            .await
            .unwrap();
        queue.enqueue(Task::new("/b")).await.unwrap();

        let due = queue.take_due(now).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].path, "/b");

        assert_eq!(queue.next_eta().await, Some(now + Duration::seconds(30)));
        let later = queue.take_due(now + Duration::seconds(31)).await;
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_repeated_params() {
        let task = Task::new("/_ah/pipeline/fanout")
            .param("parent_key", "p")
            .param("child_indexes", "0")
            .param("child_indexes", "2");
        assert_eq!(task.get_param("parent_key"), Some("p"));
        assert_eq!(task.get_params("child_indexes"), vec!["0", "2"]);
    }
}
