//! Barrier notification.
//!
//! When a slot fills, the `output` handler walks the barrier index rows for
//! that slot (a strongly consistent scan), checks each indexed barrier's
//! full blocking set against the slot records, and fires the satisfied ones
//! with a compare-and-set so concurrent deliveries fire each barrier once.
//! Index pages beyond the batch limit continue in a follow-up task.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::store::{FireOutcome, RecordStore};
use crate::types::{BarrierPurpose, SlotStatus};

/// Result of one notification batch.
#[derive(Debug, Default)]
pub struct NotifyOutcome {
    /// Barriers this batch moved WAITING → FIRED, in index order.
    pub fired: Vec<(Uuid, BarrierPurpose)>,
    /// Store cursor for the next batch, if the scan was truncated.
    pub continuation: Option<String>,
}

/// Run one batch of the notify algorithm for a freshly filled slot.
pub async fn notify_barriers(
    store: &dyn RecordStore,
    slot_id: Uuid,
    cursor: Option<&str>,
    batch_size: usize,
    now: DateTime<Utc>,
) -> Result<NotifyOutcome> {
    let page = store
        .list_barrier_indexes(slot_id, cursor, batch_size)
        .await?;

    let mut outcome = NotifyOutcome {
        fired: Vec::new(),
        continuation: page.cursor,
    };

    for entry in page.items {
        let Some(barrier) = store
            .load_barrier(entry.target_pipeline_id, entry.purpose)
            .await?
        else {
            tracing::warn!(
                slot_id = %slot_id,
                target = %entry.target_pipeline_id,
                purpose = %entry.purpose,
                "barrier index points at a missing barrier"
            );
            continue;
        };

        if barrier.status == crate::types::BarrierStatus::Fired {
            continue;
        }

        let slots = store.load_slots(&barrier.blocking_slots).await?;
        let mut satisfied = true;
        for (key, slot) in barrier.blocking_slots.iter().zip(slots.iter()) {
            match slot {
                None => bail!(
                    "blocking slot {} for barrier ({}, {}) disappeared",
                    key,
                    barrier.target_pipeline_id,
                    barrier.purpose
                ),
                Some(record) if record.status != SlotStatus::Filled => {
                    satisfied = false;
                    break;
                }
                Some(_) => {}
            }
        }
        if !satisfied {
            continue;
        }

        match store
            .fire_barrier(barrier.target_pipeline_id, barrier.purpose, now)
            .await?
        {
            FireOutcome::Fired => {
                tracing::debug!(
                    target = %barrier.target_pipeline_id,
                    purpose = %barrier.purpose,
                    "barrier fired"
                );
                outcome
                    .fired
                    .push((barrier.target_pipeline_id, barrier.purpose));
            }
            // A concurrent delivery won the CAS; it also enqueued the
            // trigger task.
            FireOutcome::AlreadyFired => {}
            FireOutcome::Missing => {
                tracing::warn!(
                    target = %barrier.target_pipeline_id,
                    purpose = %barrier.purpose,
                    "barrier vanished between load and fire"
                );
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordStore, RootGraph};
    use crate::store_memory::MemoryStore;
    use crate::types::*;

    fn make_root(id: Uuid) -> PipelineRecord {
        PipelineRecord {
            id,
            class_path: "demo.Root".to_string(),
            root_pipeline_id: id,
            is_root_pipeline: true,
            params: ValueDocument::inline("{}".to_string()),
            fanned_out: Vec::new(),
            status: PipelineStatus::Waiting,
            current_attempt: 0,
            max_attempts: 3,
            next_retry_time: None,
            retry_message: None,
            abort_message: None,
            abort_requested: false,
            start_time: None,
            finalized_time: None,
        }
    }

    fn make_slot(id: Uuid, root: Uuid) -> SlotRecord {
        SlotRecord {
            id,
            root_pipeline_id: root,
            filler: None,
            value: None,
            status: SlotStatus::Waiting,
            fill_time: None,
        }
    }

    /// Store with one barrier blocked on two slots, plus its indexes.
    async fn two_slot_barrier() -> (MemoryStore, Uuid, Uuid, Uuid) {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let target = Uuid::now_v7();
        let slot_a = Uuid::now_v7();
        let slot_b = Uuid::now_v7();

        store
            .create_root(RootGraph {
                pipeline: make_root(root),
                slots: vec![make_slot(slot_a, root), make_slot(slot_b, root)],
                barriers: vec![BarrierRecord {
                    target_pipeline_id: target,
                    purpose: BarrierPurpose::Start,
                    root_pipeline_id: root,
                    blocking_slots: vec![slot_a, slot_b],
                    status: BarrierStatus::Waiting,
                    trigger_time: None,
                }],
                barrier_indexes: vec![
                    BarrierIndexEntry {
                        slot_id: slot_a,
                        target_pipeline_id: target,
                        purpose: BarrierPurpose::Start,
                        root_pipeline_id: root,
                    },
                    BarrierIndexEntry {
                        slot_id: slot_b,
                        target_pipeline_id: target,
                        purpose: BarrierPurpose::Start,
                        root_pipeline_id: root,
                    },
                ],
            })
            .await
            .unwrap();

        (store, target, slot_a, slot_b)
    }

    async fn fill(store: &MemoryStore, slot: Uuid) {
        store
            .fill_slot(
                slot,
                Uuid::now_v7(),
                Uuid::now_v7(),
                ValueDocument::inline("null".to_string()),
                Utc::now(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_barrier_waits_for_every_blocking_slot() {
        let (store, target, slot_a, slot_b) = two_slot_barrier().await;

        fill(&store, slot_a).await;
        let outcome = notify_barriers(&store, slot_a, None, 10, Utc::now())
            .await
            .unwrap();
        assert!(outcome.fired.is_empty());

        fill(&store, slot_b).await;
        let outcome = notify_barriers(&store, slot_b, None, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.fired, vec![(target, BarrierPurpose::Start)]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_fires_once() {
        let (store, target, slot_a, slot_b) = two_slot_barrier().await;
        fill(&store, slot_a).await;
        fill(&store, slot_b).await;

        let first = notify_barriers(&store, slot_b, None, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.fired.len(), 1);

        // Second delivery of the same output task: barrier already FIRED.
        let second = notify_barriers(&store, slot_b, None, 10, Utc::now())
            .await
            .unwrap();
        assert!(second.fired.is_empty());

        let barrier = store
            .load_barrier(target, BarrierPurpose::Start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(barrier.status, BarrierStatus::Fired);
    }

    #[tokio::test]
    async fn test_missing_blocking_slot_is_fatal() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let target = Uuid::now_v7();
        let present = Uuid::now_v7();
        let phantom = Uuid::now_v7();

        store
            .create_root(RootGraph {
                pipeline: make_root(root),
                slots: vec![make_slot(present, root)],
                barriers: vec![BarrierRecord {
                    target_pipeline_id: target,
                    purpose: BarrierPurpose::Start,
                    root_pipeline_id: root,
                    blocking_slots: vec![present, phantom],
                    status: BarrierStatus::Waiting,
                    trigger_time: None,
                }],
                barrier_indexes: vec![BarrierIndexEntry {
                    slot_id: present,
                    target_pipeline_id: target,
                    purpose: BarrierPurpose::Start,
                    root_pipeline_id: root,
                }],
            })
            .await
            .unwrap();
        fill(&store, present).await;

        let result = notify_barriers(&store, present, None, 10, Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_limit_yields_continuation() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let slot = Uuid::now_v7();
        let mut barriers = Vec::new();
        let mut indexes = Vec::new();
        for _ in 0..4 {
            let target = Uuid::now_v7();
            barriers.push(BarrierRecord {
                target_pipeline_id: target,
                purpose: BarrierPurpose::Start,
                root_pipeline_id: root,
                blocking_slots: vec![slot],
                status: BarrierStatus::Waiting,
                trigger_time: None,
            });
            indexes.push(BarrierIndexEntry {
                slot_id: slot,
                target_pipeline_id: target,
                purpose: BarrierPurpose::Start,
                root_pipeline_id: root,
            });
        }
        store
            .create_root(RootGraph {
                pipeline: make_root(root),
                slots: vec![make_slot(slot, root)],
                barriers,
                barrier_indexes: indexes,
            })
            .await
            .unwrap();
        fill(&store, slot).await;

        let first = notify_barriers(&store, slot, None, 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.fired.len(), 3);
        let cursor = first.continuation.expect("continuation expected");

        let second = notify_barriers(&store, slot, Some(&cursor), 3, Utc::now())
            .await
            .unwrap();
        assert_eq!(second.fired.len(), 1);
        assert!(second.continuation.is_none());
    }
}
