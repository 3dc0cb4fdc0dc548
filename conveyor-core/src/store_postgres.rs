use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::store::*;
use crate::types::*;

/// PostgreSQL-backed implementation of `RecordStore`.
///
/// Every coarse operation that §5 requires to be atomic runs inside one
/// database transaction; guarded transitions are single UPDATEs whose WHERE
/// clause encodes the guard.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run conveyor migrations")?;
        Ok(())
    }
}

fn uuid_list_to_json(ids: &[Uuid]) -> serde_json::Value {
    serde_json::Value::Array(
        ids.iter()
            .map(|id| serde_json::Value::String(id.to_string()))
            .collect(),
    )
}

fn uuid_list_from_json(value: serde_json::Value) -> Result<Vec<Uuid>> {
    let raw: Vec<String> = serde_json::from_value(value).context("bad uuid list")?;
    raw.iter()
        .map(|s| Uuid::parse_str(s).map_err(|e| anyhow!("bad uuid in list: {e}")))
        .collect()
}

fn pipeline_status_from_str(raw: &str) -> Result<PipelineStatus> {
    match raw {
        "waiting" => Ok(PipelineStatus::Waiting),
        "run" => Ok(PipelineStatus::Run),
        "done" => Ok(PipelineStatus::Done),
        "aborted" => Ok(PipelineStatus::Aborted),
        other => Err(anyhow!("unknown pipeline status: {other}")),
    }
}

fn value_document(inline: Option<String>, blob: Option<String>) -> Option<ValueDocument> {
    match (inline, blob) {
        (None, None) => None,
        (inline_text, blob_handle) => Some(ValueDocument {
            inline_text,
            blob_handle,
        }),
    }
}

fn pipeline_from_row(row: &PgRow) -> Result<PipelineRecord> {
    let status: String = row.try_get("status")?;
    Ok(PipelineRecord {
        id: row.try_get("id")?,
        class_path: row.try_get("class_path")?,
        root_pipeline_id: row.try_get("root_pipeline_id")?,
        is_root_pipeline: row.try_get("is_root_pipeline")?,
        params: value_document(row.try_get("params_inline")?, row.try_get("params_blob")?)
            .ok_or_else(|| anyhow!("pipeline row without params"))?,
        fanned_out: uuid_list_from_json(row.try_get("fanned_out")?)?,
        status: pipeline_status_from_str(&status)?,
        current_attempt: row.try_get::<i32, _>("current_attempt")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        next_retry_time: row.try_get("next_retry_time")?,
        retry_message: row.try_get("retry_message")?,
        abort_message: row.try_get("abort_message")?,
        abort_requested: row.try_get("abort_requested")?,
        start_time: row.try_get("start_time")?,
        finalized_time: row.try_get("finalized_time")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<SlotRecord> {
    let status: String = row.try_get("status")?;
    Ok(SlotRecord {
        id: row.try_get("id")?,
        root_pipeline_id: row.try_get("root_pipeline_id")?,
        filler: row.try_get("filler")?,
        value: value_document(row.try_get("value_inline")?, row.try_get("value_blob")?),
        status: match status.as_str() {
            "waiting" => SlotStatus::Waiting,
            "filled" => SlotStatus::Filled,
            other => return Err(anyhow!("unknown slot status: {other}")),
        },
        fill_time: row.try_get("fill_time")?,
    })
}

fn barrier_from_row(row: &PgRow) -> Result<BarrierRecord> {
    let purpose: String = row.try_get("purpose")?;
    let status: String = row.try_get("status")?;
    Ok(BarrierRecord {
        target_pipeline_id: row.try_get("target_pipeline_id")?,
        purpose: purpose.parse().map_err(|e: String| anyhow!(e))?,
        root_pipeline_id: row.try_get("root_pipeline_id")?,
        blocking_slots: uuid_list_from_json(row.try_get("blocking_slots")?)?,
        status: match status.as_str() {
            "waiting" => BarrierStatus::Waiting,
            "fired" => BarrierStatus::Fired,
            other => return Err(anyhow!("unknown barrier status: {other}")),
        },
        trigger_time: row.try_get("trigger_time")?,
    })
}

fn status_from_row(row: &PgRow) -> Result<StatusRecord> {
    Ok(StatusRecord {
        pipeline_id: row.try_get("pipeline_id")?,
        root_pipeline_id: row.try_get("root_pipeline_id")?,
        message: row.try_get("message")?,
        console_url: row.try_get("console_url")?,
        links: serde_json::from_value(row.try_get("links")?).context("bad status links")?,
        status_time: row.try_get("status_time")?,
    })
}

async fn insert_pipeline(tx: &mut Transaction<'_, Postgres>, rec: &PipelineRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pipelines (
            id, class_path, root_pipeline_id, is_root_pipeline,
            params_inline, params_blob, fanned_out, status,
            current_attempt, max_attempts, next_retry_time, retry_message,
            abort_message, abort_requested, start_time, finalized_time
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(rec.id)
    .bind(&rec.class_path)
    .bind(rec.root_pipeline_id)
    .bind(rec.is_root_pipeline)
    .bind(&rec.params.inline_text)
    .bind(&rec.params.blob_handle)
    .bind(uuid_list_to_json(&rec.fanned_out))
    .bind(rec.status.as_str())
    .bind(rec.current_attempt as i32)
    .bind(rec.max_attempts as i32)
    .bind(rec.next_retry_time)
    .bind(&rec.retry_message)
    .bind(&rec.abort_message)
    .bind(rec.abort_requested)
    .bind(rec.start_time)
    .bind(rec.finalized_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_slot(tx: &mut Transaction<'_, Postgres>, slot: &SlotRecord) -> Result<()> {
    let (value_inline, value_blob) = match &slot.value {
        Some(doc) => (doc.inline_text.clone(), doc.blob_handle.clone()),
        None => (None, None),
    };
    sqlx::query(
        r#"
        INSERT INTO slots (id, root_pipeline_id, filler, value_inline, value_blob, status, fill_time)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(slot.id)
    .bind(slot.root_pipeline_id)
    .bind(slot.filler)
    .bind(value_inline)
    .bind(value_blob)
    .bind(match slot.status {
        SlotStatus::Waiting => "waiting",
        SlotStatus::Filled => "filled",
    })
    .bind(slot.fill_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_barrier(tx: &mut Transaction<'_, Postgres>, barrier: &BarrierRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO barriers (
            target_pipeline_id, purpose, root_pipeline_id,
            blocking_slots, status, trigger_time
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (target_pipeline_id, purpose) DO NOTHING
        "#,
    )
    .bind(barrier.target_pipeline_id)
    .bind(barrier.purpose.as_str())
    .bind(barrier.root_pipeline_id)
    .bind(uuid_list_to_json(&barrier.blocking_slots))
    .bind(match barrier.status {
        BarrierStatus::Waiting => "waiting",
        BarrierStatus::Fired => "fired",
    })
    .bind(barrier.trigger_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_barrier_index(
    tx: &mut Transaction<'_, Postgres>,
    entry: &BarrierIndexEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO barrier_indexes (slot_id, target_pipeline_id, purpose, root_pipeline_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (slot_id, target_pipeline_id, purpose) DO NOTHING
        "#,
    )
    .bind(entry.slot_id)
    .bind(entry.target_pipeline_id)
    .bind(entry.purpose.as_str())
    .bind(entry.root_pipeline_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl RecordStore for PostgresStore {
    // ── Pipelines ──

    async fn save_pipeline(&self, record: &PipelineRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (
                id, class_path, root_pipeline_id, is_root_pipeline,
                params_inline, params_blob, fanned_out, status,
                current_attempt, max_attempts, next_retry_time, retry_message,
                abort_message, abort_requested, start_time, finalized_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                class_path = EXCLUDED.class_path,
                params_inline = EXCLUDED.params_inline,
                params_blob = EXCLUDED.params_blob,
                fanned_out = EXCLUDED.fanned_out,
                status = EXCLUDED.status,
                current_attempt = EXCLUDED.current_attempt,
                max_attempts = EXCLUDED.max_attempts,
                next_retry_time = EXCLUDED.next_retry_time,
                retry_message = EXCLUDED.retry_message,
                abort_message = EXCLUDED.abort_message,
                abort_requested = EXCLUDED.abort_requested,
                start_time = EXCLUDED.start_time,
                finalized_time = EXCLUDED.finalized_time
            "#,
        )
        .bind(record.id)
        .bind(&record.class_path)
        .bind(record.root_pipeline_id)
        .bind(record.is_root_pipeline)
        .bind(&record.params.inline_text)
        .bind(&record.params.blob_handle)
        .bind(uuid_list_to_json(&record.fanned_out))
        .bind(record.status.as_str())
        .bind(record.current_attempt as i32)
        .bind(record.max_attempts as i32)
        .bind(record.next_retry_time)
        .bind(&record.retry_message)
        .bind(&record.abort_message)
        .bind(record.abort_requested)
        .bind(record.start_time)
        .bind(record.finalized_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query("SELECT * FROM pipelines WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pipeline_from_row).transpose()
    }

    async fn list_roots(
        &self,
        class_path: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>> {
        let after = cursor.map(Uuid::parse_str).transpose().context("bad cursor")?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM pipelines
            WHERE is_root_pipeline
              AND ($1::text IS NULL OR class_path = $1)
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(class_path)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<PipelineRecord> = rows
            .iter()
            .map(pipeline_from_row)
            .collect::<Result<Vec<_>>>()?;
        let cursor = (items.len() == limit)
            .then(|| items.last().map(|rec| rec.id.to_string()))
            .flatten();
        Ok(Page { items, cursor })
    }

    async fn list_by_root(
        &self,
        root_pipeline_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<PipelineRecord>> {
        let after = cursor.map(Uuid::parse_str).transpose().context("bad cursor")?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM pipelines
            WHERE root_pipeline_id = $1
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(root_pipeline_id)
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<PipelineRecord> = rows
            .iter()
            .map(pipeline_from_row)
            .collect::<Result<Vec<_>>>()?;
        let cursor = (items.len() == limit)
            .then(|| items.last().map(|rec| rec.id.to_string()))
            .flatten();
        Ok(Page { items, cursor })
    }

    // ── Guarded transitions ──

    async fn create_root(&self, graph: RootGraph) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query("SELECT 1 FROM pipelines WHERE id = $1")
            .bind(graph.pipeline.id)
            .fetch_optional(&mut *tx)
            .await?;
        if inserted.is_some() {
            return Ok(false);
        }

        insert_pipeline(&mut tx, &graph.pipeline).await?;
        for slot in &graph.slots {
            insert_slot(&mut tx, slot).await?;
        }
        for barrier in &graph.barriers {
            insert_barrier(&mut tx, barrier).await?;
        }
        for entry in &graph.barrier_indexes {
            insert_barrier_index(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_start(&self, id: Uuid, attempt: u32, time: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET start_time = COALESCE(start_time, $3)
            WHERE id = $1 AND status = 'waiting' AND current_attempt = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_running(&self, id: Uuid, attempt: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = 'run'
            WHERE id = $1 AND status = 'waiting' AND current_attempt = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit_child_graph(
        &self,
        parent_id: Uuid,
        attempt: u32,
        graph: ChildGraph,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE pipelines
            SET fanned_out = $3, status = 'run'
            WHERE id = $1 AND status = 'waiting' AND current_attempt = $2
            "#,
        )
        .bind(parent_id)
        .bind(attempt as i32)
        .bind(uuid_list_to_json(&graph.fanned_out))
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        for child in &graph.children {
            insert_pipeline(&mut tx, child).await?;
        }
        for slot in &graph.slots {
            insert_slot(&mut tx, slot).await?;
        }
        for barrier in &graph.barriers {
            insert_barrier(&mut tx, barrier).await?;
        }
        for entry in &graph.barrier_indexes {
            insert_barrier_index(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn mark_finalized(
        &self,
        id: Uuid,
        status: PipelineStatus,
        time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET status = $2, finalized_time = $3
            WHERE id = $1 AND status IN ('waiting', 'run')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(time)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_retry(
        &self,
        id: Uuid,
        expected_attempt: u32,
        next_retry_time: DateTime<Utc>,
        retry_message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET current_attempt = current_attempt + 1,
                next_retry_time = $3,
                retry_message = $4,
                status = 'waiting'
            WHERE id = $1 AND current_attempt = $2 AND status IN ('waiting', 'run')
            "#,
        )
        .bind(id)
        .bind(expected_attempt as i32)
        .bind(next_retry_time)
        .bind(retry_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_abort(&self, root_pipeline_id: Uuid, message: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines
            SET abort_requested = TRUE, abort_message = $2
            WHERE id = $1 AND is_root_pipeline AND NOT abort_requested
            "#,
        )
        .bind(root_pipeline_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Slots ──

    async fn load_slot(&self, id: Uuid) -> Result<Option<SlotRecord>> {
        let row = sqlx::query("SELECT * FROM slots WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(slot_from_row).transpose()
    }

    async fn load_slots(&self, ids: &[Uuid]) -> Result<Vec<Option<SlotRecord>>> {
        let rows = sqlx::query("SELECT * FROM slots WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        let mut by_id = std::collections::HashMap::new();
        for row in &rows {
            let slot = slot_from_row(row)?;
            by_id.insert(slot.id, slot);
        }
        Ok(ids.iter().map(|id| by_id.get(id).cloned()).collect())
    }

    async fn list_slots_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<SlotRecord>> {
        let rows = sqlx::query("SELECT * FROM slots WHERE root_pipeline_id = $1 ORDER BY id")
            .bind(root_pipeline_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn fill_slot(
        &self,
        id: Uuid,
        root_pipeline_id: Uuid,
        filler: Uuid,
        value: ValueDocument,
        time: DateTime<Utc>,
    ) -> Result<FillOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT status FROM slots WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            None => {
                insert_slot(
                    &mut tx,
                    &SlotRecord {
                        id,
                        root_pipeline_id,
                        filler: Some(filler),
                        value: Some(value),
                        status: SlotStatus::Filled,
                        fill_time: Some(time),
                    },
                )
                .await?;
                FillOutcome::Created
            }
            Some(row) => {
                let status: String = row.try_get("status")?;
                if status == "waiting" {
                    sqlx::query(
                        r#"
                        UPDATE slots
                        SET status = 'filled', filler = $2, value_inline = $3,
                            value_blob = $4, fill_time = $5
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(filler)
                    .bind(&value.inline_text)
                    .bind(&value.blob_handle)
                    .bind(time)
                    .execute(&mut *tx)
                    .await?;
                    FillOutcome::Filled
                } else {
                    // Re-fill: overwrite the value, keep the first filler.
                    sqlx::query(
                        r#"
                        UPDATE slots
                        SET value_inline = $2, value_blob = $3, fill_time = $4
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(&value.inline_text)
                    .bind(&value.blob_handle)
                    .bind(time)
                    .execute(&mut *tx)
                    .await?;
                    FillOutcome::Refilled
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // ── Barriers ──

    async fn load_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
    ) -> Result<Option<BarrierRecord>> {
        let row =
            sqlx::query("SELECT * FROM barriers WHERE target_pipeline_id = $1 AND purpose = $2")
                .bind(target_pipeline_id)
                .bind(purpose.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(barrier_from_row).transpose()
    }

    async fn list_barriers_by_root(&self, root_pipeline_id: Uuid) -> Result<Vec<BarrierRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM barriers WHERE root_pipeline_id = $1 ORDER BY target_pipeline_id, purpose",
        )
        .bind(root_pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(barrier_from_row).collect()
    }

    async fn fire_barrier(
        &self,
        target_pipeline_id: Uuid,
        purpose: BarrierPurpose,
        time: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE barriers
            SET status = 'fired', trigger_time = $3
            WHERE target_pipeline_id = $1 AND purpose = $2 AND status = 'waiting'
            "#,
        )
        .bind(target_pipeline_id)
        .bind(purpose.as_str())
        .bind(time)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(FireOutcome::Fired);
        }

        let exists =
            sqlx::query("SELECT 1 FROM barriers WHERE target_pipeline_id = $1 AND purpose = $2")
                .bind(target_pipeline_id)
                .bind(purpose.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(if exists.is_some() {
            FireOutcome::AlreadyFired
        } else {
            FireOutcome::Missing
        })
    }

    async fn list_barrier_indexes(
        &self,
        slot_id: Uuid,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<BarrierIndexEntry>> {
        let (after_target, after_purpose) = match cursor {
            None => (None, None),
            Some(raw) => {
                let (target, purpose) = raw
                    .split_once('/')
                    .ok_or_else(|| anyhow!("bad index cursor"))?;
                (
                    Some(Uuid::parse_str(target).context("bad index cursor")?),
                    Some(purpose.to_string()),
                )
            }
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM barrier_indexes
            WHERE slot_id = $1
              AND ($2::uuid IS NULL OR (target_pipeline_id, purpose) > ($2, $3))
            ORDER BY target_pipeline_id, purpose
            LIMIT $4
            "#,
        )
        .bind(slot_id)
        .bind(after_target)
        .bind(after_purpose)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let purpose: String = row.try_get("purpose")?;
            items.push(BarrierIndexEntry {
                slot_id: row.try_get("slot_id")?,
                target_pipeline_id: row.try_get("target_pipeline_id")?,
                purpose: purpose.parse().map_err(|e: String| anyhow!(e))?,
                root_pipeline_id: row.try_get("root_pipeline_id")?,
            });
        }
        let cursor = (items.len() == limit).then(|| {
            items
                .last()
                .map(|entry| format!("{}/{}", entry.target_pipeline_id, entry.purpose))
        });
        Ok(Page {
            items,
            cursor: cursor.flatten(),
        })
    }

    // ── Status records ──

    async fn save_status_record(&self, record: &StatusRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO status_records (
                pipeline_id, root_pipeline_id, message, console_url, links, status_time
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (pipeline_id) DO UPDATE SET
                message = EXCLUDED.message,
                console_url = EXCLUDED.console_url,
                links = EXCLUDED.links,
                status_time = EXCLUDED.status_time
            "#,
        )
        .bind(record.pipeline_id)
        .bind(record.root_pipeline_id)
        .bind(&record.message)
        .bind(&record.console_url)
        .bind(serde_json::to_value(&record.links)?)
        .bind(record.status_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_status_record(&self, pipeline_id: Uuid) -> Result<Option<StatusRecord>> {
        let row = sqlx::query("SELECT * FROM status_records WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(status_from_row).transpose()
    }

    async fn list_status_records_by_root(
        &self,
        root_pipeline_id: Uuid,
    ) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query("SELECT * FROM status_records WHERE root_pipeline_id = $1")
            .bind(root_pipeline_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(status_from_row).collect()
    }

    // ── Cleanup ──

    async fn purge_root(&self, root_pipeline_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for table in [
            "pipelines",
            "slots",
            "barriers",
            "barrier_indexes",
            "status_records",
        ] {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE root_pipeline_id = $1"
            ))
            .bind(root_pipeline_id)
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}
