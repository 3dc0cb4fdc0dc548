use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::*;
use crate::types::*;

struct Inner {
    pipelines: HashMap<Uuid, PipelineRecord>,
    slots: HashMap<Uuid, SlotRecord>,
    barriers: HashMap<(Uuid, BarrierPurpose), BarrierRecord>,
    /// Keyed so a range scan over one slot id walks its dependents in a
    /// stable order, which is what the notify cursor leans on.
    barrier_indexes: BTreeMap<(Uuid, Uuid, BarrierPurpose), BarrierIndexEntry>,
    statuses: HashMap<Uuid, StatusRecord>,
}

/// In-memory implementation of `RecordStore` for tests and the dev server.
/// A single `RwLock` over the whole state makes every coarse operation
/// trivially atomic.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                pipelines: HashMap::new(),
                slots: HashMap::new(),
                barriers: HashMap::new(),
                barrier_indexes: BTreeMap::new(),
                statuses: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn page_after<T, K: Ord>(
    mut keyed: Vec<(K, T)>,
    cursor: Option<&str>,
    limit: usize,
    parse: impl Fn(&str) -> Option<K>,
    render: impl Fn(&K) -> String,
) -> Page<T> {
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let start_after = cursor.and_then(|c| parse(c));
    let mut items = Vec::new();
    let mut truncated = false;
    for (key, item) in keyed {
        if let Some(after) = &start_after {
            if key <= *after {
                continue;
            }
        }
        if items.len() == limit {
            truncated = true;
            break;
        }
        items.push((key, item));
    }
    let cursor = if truncated {
        items.last().map(|(key, _)| render(key))
    } else {
        None
    };
    Page {
        items: items.into_iter().map(|(_, item)| item).collect(),
        cursor,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    // ── Pipelines ──

    async fn save_pipeline(&self, record: &PipelineRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.pipelines.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        let r = self.inner.read().await;
        Ok(r.pipelines.get(&id).cloned())
    }

    async fn list_roots(
        &self,
        class_path: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>> {
        let r = self.inner.read().await;
        let keyed: Vec<(Uuid, PipelineRecord)> = r
            .pipelines
            .values()
            .filter(|p| p.is_root_pipeline)
            .filter(|p| class_path.map_or(true, |cp| p.class_path == cp))
            .map(|p| (p.id, p.clone()))
            .collect();
        Ok(page_after(
            keyed,
            cursor,
            limit,
            |c| Uuid::parse_str(c).ok(),
            Uuid::to_string,
        ))
    }

    async fn list_by_root(
        &self,
        root_pipeline_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>> {
        let r = self.inner.read().await;
        let keyed: Vec<(Uuid, PipelineRecord)> = r
            .pipelines
            .values()
            .filter(|p| p.root_pipeline_id == root_pipeline_id)
            .map(|p| (p.id, p.clone()))
            .collect();
        Ok(page_after(
            keyed,
            cursor,
            limit,
            |c| Uuid::parse_str(c).ok(),
            Uuid::to_string,
        ))
    }

    // ── Guarded transitions ──

    async fn create_root(&self, graph: RootGraph) -> Result<bool> {
        let mut w = self.inner.write().await;
        if w.pipelines.contains_key(&graph.pipeline.id) {
            return Ok(false);
        }
        w.pipelines.insert(graph.pipeline.id, graph.pipeline);
        for slot in graph.slots {
            w.slots.insert(slot.id, slot);
        }
        for barrier in graph.barriers {
            w.barriers
                .insert((barrier.target_pipeline_id, barrier.purpose), barrier);
        }
        for index in graph.barrier_indexes {
            w.barrier_indexes.insert(
                (index.slot_id, index.target_pipeline_id, index.purpose),
                index,
            );
        }
        Ok(true)
    }

    async fn record_start(&self, id: Uuid, attempt: u32, time: DateTime<Utc>) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(rec) = w.pipelines.get_mut(&id) else {
            return Ok(false);
        };
        if rec.status != PipelineStatus::Waiting || rec.current_attempt != attempt {
            return Ok(false);
        }
        if rec.start_time.is_none() {
            rec.start_time = Some(time);
        }
        Ok(true)
    }

    async fn mark_running(&self, id: Uuid, attempt: u32) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(rec) = w.pipelines.get_mut(&id) else {
            return Ok(false);
        };
        if rec.status != PipelineStatus::Waiting || rec.current_attempt != attempt {
            return Ok(false);
        }
        rec.status = PipelineStatus::Run;
        Ok(true)
    }

    async fn commit_child_graph(
        &self,
        parent_id: Uuid,
        attempt: u32,
        graph: ChildGraph,
    ) -> Result<CommitOutcome> {
        let mut w = self.inner.write().await;
        {
            let Some(parent) = w.pipelines.get_mut(&parent_id) else {
                return Ok(CommitOutcome::AlreadyCommitted);
            };
            if parent.status != PipelineStatus::Waiting || parent.current_attempt != attempt {
                return Ok(CommitOutcome::AlreadyCommitted);
            }
            parent.fanned_out = graph.fanned_out.clone();
            parent.status = PipelineStatus::Run;
        }
        for child in graph.children {
            w.pipelines.insert(child.id, child);
        }
        for slot in graph.slots {
            w.slots.insert(slot.id, slot);
        }
        for barrier in graph.barriers {
            w.barriers
                .insert((barrier.target_pipeline_id, barrier.purpose), barrier);
        }
        for index in graph.barrier_indexes {
            w.barrier_indexes.insert(
                (index.slot_id, index.target_pipeline_id, index.purpose),
                index,
            );
        }
        Ok(CommitOutcome::Committed)
    }

    async fn mark_finalized(
        &self,
        id: Uuid,
        status: PipelineStatus,
        time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(rec) = w.pipelines.get_mut(&id) else {
            return Ok(false);
        };
        if rec.status.is_terminal() {
            return Ok(false);
        }
        rec.status = status;
        rec.finalized_time = Some(time);
        Ok(true)
    }

    async fn apply_retry(
        &self,
        id: Uuid,
        expected_attempt: u32,
        next_retry_time: DateTime<Utc>,
        retry_message: &str,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(rec) = w.pipelines.get_mut(&id) else {
            return Ok(false);
        };
        if rec.status.is_terminal() || rec.current_attempt != expected_attempt {
            return Ok(false);
        }
        rec.current_attempt += 1;
        rec.next_retry_time = Some(next_retry_time);
        rec.retry_message = Some(retry_message.to_string());
        rec.status = PipelineStatus::Waiting;
        Ok(true)
    }

    async fn request_abort(&self, root_pipeline_id: Uuid, message: Option<&str>) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(rec) = w.pipelines.get_mut(&root_pipeline_id) else {
            return Ok(false);
        };
        if !rec.is_root_pipeline || rec.abort_requested {
            return Ok(false);
        }
        rec.abort_requested = true;
        rec.abort_message = message.map(str::to_string);
        Ok(true)
    }

    // ── Slots ──

    async fn load_slot(&self, id: Uuid) -> Result<Option<SlotRecord>> {
        let r = self.inner.read().await;
        Ok(r.slots.get(&id).cloned())
    }

    async fn load_slots(&self, ids: &[Uuid]) -> Result<Vec<Option<SlotRecord>>> {
        let r = self.inner.read().await;
        Ok(ids.iter().map(|id| r.slots.get(id).cloned()).collect())
    }

    async fn list_slots_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<SlotRecord>> {
        let r = self.inner.read().await;
        let mut slots: Vec<SlotRecord> = r
            .slots
            .values()
            .filter(|s| s.root_pipeline_id == root_pipeline_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.id);
        Ok(slots)
    }

    async fn fill_slot(
        &self,
        id: Uuid,
        root_pipeline_id: Uuid,
        filler: Uuid,
        value: ValueDocument,
        time: DateTime<Utc>,
    ) -> Result<FillOutcome> {
        let mut w = self.inner.write().await;
        let Some(slot) = w.slots.get_mut(&id) else {
            w.slots.insert(
                id,
                SlotRecord {
                    id,
                    root_pipeline_id,
                    filler: Some(filler),
                    value: Some(value),
                    status: SlotStatus::Filled,
                    fill_time: Some(time),
                },
            );
            return Ok(FillOutcome::Created);
        };
        match slot.status {
            SlotStatus::Waiting => {
                slot.status = SlotStatus::Filled;
                slot.filler = Some(filler);
                slot.value = Some(value);
                slot.fill_time = Some(time);
                Ok(FillOutcome::Filled)
            }
            SlotStatus::Filled => {
                slot.value = Some(value);
                slot.fill_time = Some(time);
                Ok(FillOutcome::Refilled)
            }
        }
    }

    // ── Barriers ──

    async fn load_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
    ) -> Result<Option<BarrierRecord>> {
        let r = self.inner.read().await;
        Ok(r.barriers.get(&(target_pipeline_id, purpose)).cloned())
    }

    async fn list_barriers_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<BarrierRecord>> {
        let r = self.inner.read().await;
        let mut barriers: Vec<BarrierRecord> = r
            .barriers
            .values()
            .filter(|b| b.root_pipeline_id == root_pipeline_id)
            .cloned()
            .collect();
        barriers.sort_by_key(|b| (b.target_pipeline_id, b.purpose));
        Ok(barriers)
    }

    async fn fire_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
        time: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let mut w = self.inner.write().await;
        let Some(barrier) = w.barriers.get_mut(&(target_pipeline_id, purpose)) else {
            return Ok(FireOutcome::Missing);
        };
        match barrier.status {
            BarrierStatus::Waiting => {
                barrier.status = BarrierStatus::Fired;
                barrier.trigger_time = Some(time);
                Ok(FireOutcome::Fired)
            }
            BarrierStatus::Fired => Ok(FireOutcome::AlreadyFired),
        }
    }

    async fn list_barrier_indexes(
        &self,
        slot_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<BarrierIndexEntry>> {
        let r = self.inner.read().await;
        let keyed: Vec<((Uuid, BarrierPurpose), BarrierIndexEntry)> = r
            .barrier_indexes
            .range(
                (slot_id, Uuid::nil(), BarrierPurpose::Start)
                    ..=(slot_id, Uuid::max(), BarrierPurpose::Abort),
            )
            .map(|((_, target, purpose), entry)| ((*target, *purpose), entry.clone()))
            .collect();
        Ok(page_after(keyed, cursor, limit, parse_index_cursor, |key| {
            format!("{}/{}", key.0, key.1)
        }))
    }

    // ── Status records ──

    async fn save_status_record(&self, record: &StatusRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.statuses.insert(record.pipeline_id, record.clone());
        Ok(())
    }

    async fn load_status_record(&self, pipeline_id: Uuid) -> Result<Option<StatusRecord>> {
        let r = self.inner.read().await;
        Ok(r.statuses.get(&pipeline_id).cloned())
    }

    async fn list_status_records_by_root(
        &self,
        root_pipeline_id: Uuid,
    ) -> Result<Vec<StatusRecord>> {
        let r = self.inner.read().await;
        Ok(r.statuses
            .values()
            .filter(|s| s.root_pipeline_id == root_pipeline_id)
            .cloned()
            .collect())
    }

    // ── Cleanup ──

    async fn purge_root(&self, root_pipeline_id: Uuid) -> Result<u64> {
        let mut w = self.inner.write().await;
        let before = w.pipelines.len()
            + w.slots.len()
            + w.barriers.len()
            + w.barrier_indexes.len()
            + w.statuses.len();
        w.pipelines
            .retain(|_, p| p.root_pipeline_id != root_pipeline_id);
        w.slots.retain(|_, s| s.root_pipeline_id != root_pipeline_id);
        w.barriers
            .retain(|_, b| b.root_pipeline_id != root_pipeline_id);
        w.barrier_indexes
            .retain(|_, i| i.root_pipeline_id != root_pipeline_id);
        w.statuses
            .retain(|_, s| s.root_pipeline_id != root_pipeline_id);
        let after = w.pipelines.len()
            + w.slots.len()
            + w.barriers.len()
            + w.barrier_indexes.len()
            + w.statuses.len();
        Ok((before - after) as u64)
    }
}

/// Cursor for index listings: `<target_uuid>/<purpose>`.
fn parse_index_cursor(cursor: &str) -> Option<(Uuid, BarrierPurpose)> {
    let (target, purpose) = cursor.split_once('/')?;
    Some((Uuid::parse_str(target).ok()?, purpose.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStore;

    fn make_pipeline(id: Uuid, root: Uuid) -> PipelineRecord {
        PipelineRecord {
            id,
            class_path: "demo.Echo".to_string(),
            root_pipeline_id: root,
            is_root_pipeline: id == root,
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

    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let rec = make_pipeline(id, id);

        store.save_pipeline(&rec).await.unwrap();
        let loaded = store.load_pipeline(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert!(loaded.is_root_pipeline);
        assert_eq!(loaded.status, PipelineStatus::Waiting);
    }

    #[tokio::test]
    async fn test_create_root_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        let graph = RootGraph {
            pipeline: make_pipeline(id, id),
            slots: vec![make_slot(Uuid::now_v7(), id)],
            barriers: Vec::new(),
            barrier_indexes: Vec::new(),
        };

        assert!(store.create_root(graph.clone()).await.unwrap());
        assert!(!store.create_root(graph).await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_slot_is_single_assignment_in_effect() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let slot_id = Uuid::now_v7();
        store
            .create_root(RootGraph {
                pipeline: make_pipeline(root, root),
                slots: vec![make_slot(slot_id, root)],
                barriers: Vec::new(),
                barrier_indexes: Vec::new(),
            })
            .await
            .unwrap();

        let filler = Uuid::now_v7();
        let outcome = store
            .fill_slot(
                slot_id,
                root,
                filler,
                ValueDocument::inline("1".to_string()),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FillOutcome::Filled);

        // Second fill from a re-executed handler: value updated, filler kept.
        let other = Uuid::now_v7();
        let outcome = store
            .fill_slot(
                slot_id,
                root,
                other,
                ValueDocument::inline("1".to_string()),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, FillOutcome::Refilled);

        let slot = store.load_slot(slot_id).await.unwrap().unwrap();
        assert_eq!(slot.status, SlotStatus::Filled);
        assert_eq!(slot.filler, Some(filler));
    }

    #[tokio::test]
    async fn test_fire_barrier_is_sticky() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let target = Uuid::now_v7();
        store
            .create_root(RootGraph {
                pipeline: make_pipeline(root, root),
                slots: Vec::new(),
                barriers: vec![BarrierRecord {
                    target_pipeline_id: target,
                    purpose: BarrierPurpose::Start,
                    root_pipeline_id: root,
                    blocking_slots: Vec::new(),
                    status: BarrierStatus::Waiting,
                    trigger_time: None,
                }],
                barrier_indexes: Vec::new(),
            })
            .await
            .unwrap();

        let t1 = Utc::now();
        assert_eq!(
            store
                .fire_barrier(target, BarrierPurpose::Start, t1)
                .await
                .unwrap(),
            FireOutcome::Fired
        );
        assert_eq!(
            store
                .fire_barrier(target, BarrierPurpose::Start, Utc::now())
                .await
                .unwrap(),
            FireOutcome::AlreadyFired
        );

        let barrier = store
            .load_barrier(target, BarrierPurpose::Start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(barrier.trigger_time, Some(t1));
    }

    #[tokio::test]
    async fn test_commit_child_graph_short_circuits_on_rerun() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        store.save_pipeline(&make_pipeline(root, root)).await.unwrap();

        let child = Uuid::now_v7();
        let graph = ChildGraph {
            children: vec![make_pipeline(child, root)],
            slots: Vec::new(),
            barriers: Vec::new(),
            barrier_indexes: Vec::new(),
            fanned_out: vec![child],
        };

        assert_eq!(
            store.commit_child_graph(root, 0, graph.clone()).await.unwrap(),
            CommitOutcome::Committed
        );
        // A generator re-run drains a second graph; the stored one wins.
        let other_child = Uuid::now_v7();
        let second = ChildGraph {
            children: vec![make_pipeline(other_child, root)],
            slots: Vec::new(),
            barriers: Vec::new(),
            barrier_indexes: Vec::new(),
            fanned_out: vec![other_child],
        };
        assert_eq!(
            store.commit_child_graph(root, 0, second).await.unwrap(),
            CommitOutcome::AlreadyCommitted
        );

        let parent = store.load_pipeline(root).await.unwrap().unwrap();
        assert_eq!(parent.fanned_out, vec![child]);
        assert_eq!(parent.status, PipelineStatus::Run);
        assert!(store.load_pipeline(other_child).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_retry_guards_attempt() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store.save_pipeline(&make_pipeline(id, id)).await.unwrap();

        let next = Utc::now();
        assert!(store.apply_retry(id, 0, next, "boom").await.unwrap());
        // Stale task for attempt 0 loses the guard.
        assert!(!store.apply_retry(id, 0, next, "boom").await.unwrap());

        let rec = store.load_pipeline(id).await.unwrap().unwrap();
        assert_eq!(rec.current_attempt, 1);
        assert_eq!(rec.retry_message.as_deref(), Some("boom"));
        assert_eq!(rec.status, PipelineStatus::Waiting);
    }

    #[tokio::test]
    async fn test_barrier_index_scan_pages_in_order() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let slot = Uuid::now_v7();
        let mut indexes = Vec::new();
        for _ in 0..5 {
            indexes.push(BarrierIndexEntry {
                slot_id: slot,
                target_pipeline_id: Uuid::now_v7(),
                purpose: BarrierPurpose::Start,
                root_pipeline_id: root,
            });
        }
        // And one entry for an unrelated slot that must not show up.
        indexes.push(BarrierIndexEntry {
            slot_id: Uuid::now_v7(),
            target_pipeline_id: Uuid::now_v7(),
            purpose: BarrierPurpose::Start,
            root_pipeline_id: root,
        });
        store
            .create_root(RootGraph {
                pipeline: make_pipeline(root, root),
                slots: Vec::new(),
                barriers: Vec::new(),
                barrier_indexes: indexes,
            })
            .await
            .unwrap();

        let first = store.list_barrier_indexes(slot, None, 3).await.unwrap();
        assert_eq!(first.items.len(), 3);
        let cursor = first.cursor.expect("more pages");

        let second = store
            .list_barrier_indexes(slot, Some(&cursor), 3)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.cursor.is_none());

        let mut seen: Vec<Uuid> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|e| e.target_pipeline_id)
            .collect();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_purge_root_removes_the_whole_closure() {
        let store = MemoryStore::new();
        let root = Uuid::now_v7();
        let other_root = Uuid::now_v7();
        let slot = Uuid::now_v7();
        store
            .create_root(RootGraph {
                pipeline: make_pipeline(root, root),
                slots: vec![make_slot(slot, root)],
                barriers: vec![BarrierRecord {
                    target_pipeline_id: root,
                    purpose: BarrierPurpose::Finalize,
                    root_pipeline_id: root,
                    blocking_slots: vec![slot],
                    status: BarrierStatus::Waiting,
                    trigger_time: None,
                }],
                barrier_indexes: vec![BarrierIndexEntry {
                    slot_id: slot,
                    target_pipeline_id: root,
                    purpose: BarrierPurpose::Finalize,
                    root_pipeline_id: root,
                }],
            })
            .await
            .unwrap();
        store
            .save_pipeline(&make_pipeline(other_root, other_root))
            .await
            .unwrap();
        store
            .save_status_record(&StatusRecord {
                pipeline_id: root,
                root_pipeline_id: root,
                message: Some("working".to_string()),
                console_url: None,
                links: Vec::new(),
                status_time: Utc::now(),
            })
            .await
            .unwrap();

        let removed = store.purge_root(root).await.unwrap();
        assert_eq!(removed, 4);

        assert!(store.load_pipeline(root).await.unwrap().is_none());
        assert!(store.load_slot(slot).await.unwrap().is_none());
        assert!(store
            .load_barrier(root, BarrierPurpose::Finalize)
            .await
            .unwrap()
            .is_none());
        assert!(store.load_status_record(root).await.unwrap().is_none());
        // Unrelated root untouched.
        assert!(store.load_pipeline(other_root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_roots_filters_by_class_path() {
        let store = MemoryStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let mut rec_a = make_pipeline(a, a);
        rec_a.class_path = "demo.A".to_string();
        let mut rec_b = make_pipeline(b, b);
        rec_b.class_path = "demo.B".to_string();
        let child = make_pipeline(Uuid::now_v7(), a);

        store.save_pipeline(&rec_a).await.unwrap();
        store.save_pipeline(&rec_b).await.unwrap();
        store.save_pipeline(&child).await.unwrap();

        let all = store.list_roots(None, None, 10).await.unwrap();
        assert_eq!(all.items.len(), 2);

        let only_a = store.list_roots(Some("demo.A"), None, 10).await.unwrap();
        assert_eq!(only_a.items.len(), 1);
        assert_eq!(only_a.items[0].id, a);
    }
}
