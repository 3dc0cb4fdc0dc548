//! Read-only query API consumed by the status UI.
//!
//! Everything here renders records into plain JSON info objects; nothing is
//! consulted by the execution path.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::engine::Engine;
use crate::types::*;

const ROOT_LIST_DEFAULT_COUNT: usize = 50;
const TREE_PAGE_SIZE: usize = 100;

fn time_ms(time: Option<DateTime<Utc>>) -> JsonValue {
    match time {
        Some(t) => json!(t.timestamp_millis()),
        None => JsonValue::Null,
    }
}

fn argument_info(arg: &ArgumentRef) -> JsonValue {
    match arg {
        ArgumentRef::Value { value } => json!({ "type": "value", "value": value }),
        ArgumentRef::Slot { slot_key } => {
            json!({ "type": "slot", "slotKey": slot_key.to_string() })
        }
    }
}

impl Engine {
    /// List root pipelines for the UI's landing page.
    pub async fn get_root_list(
        &self,
        class_path: Option<&str>,
        cursor: Option<&str>,
        count: Option<usize>,
    ) -> Result<JsonValue> {
        let page = self
            .store()
            .list_roots(
                class_path,
                cursor,
                count.unwrap_or(ROOT_LIST_DEFAULT_COUNT),
            )
            .await?;

        let mut pipelines = Vec::with_capacity(page.items.len());
        for rec in &page.items {
            let status = self.store().load_status_record(rec.id).await?;
            let mut info = self.pipeline_info(rec, status.as_ref()).await;
            info.insert("pipelineId".to_string(), json!(rec.id.to_string()));
            pipelines.push(JsonValue::Object(info));
        }

        let mut response = Map::new();
        response.insert("pipelines".to_string(), json!(pipelines));
        if let Some(cursor) = page.cursor {
            response.insert("cursor".to_string(), json!(cursor));
        }
        Ok(JsonValue::Object(response))
    }

    /// Full tree of one workflow: every pipeline and slot under the root.
    pub async fn get_status_tree(&self, root_pipeline_id: Uuid) -> Result<JsonValue> {
        let Some(root) = self.store().load_pipeline(root_pipeline_id).await? else {
            bail!("root pipeline not found: {root_pipeline_id}");
        };
        if !root.is_root_pipeline {
            bail!("pipeline {root_pipeline_id} is not a root");
        }

        let statuses: BTreeMap<Uuid, StatusRecord> = self
            .store()
            .list_status_records_by_root(root.id)
            .await?
            .into_iter()
            .map(|s| (s.pipeline_id, s))
            .collect();

        let mut pipelines = Map::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store()
                .list_by_root(root.id, cursor.as_deref(), TREE_PAGE_SIZE)
                .await?;
            for rec in &page.items {
                let info = self.pipeline_info(rec, statuses.get(&rec.id)).await;
                pipelines.insert(rec.id.to_string(), JsonValue::Object(info));
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut slots = Map::new();
        for slot in self.store().list_slots_by_root(root.id).await? {
            slots.insert(slot.id.to_string(), self.slot_info(&slot).await);
        }

        Ok(json!({
            "rootPipelineId": root.id.to_string(),
            "pipelines": pipelines,
            "slots": slots,
        }))
    }

    /// Registered stage class paths, for the UI's class filter.
    pub fn get_pipeline_names(&self) -> Vec<String> {
        self.registry().class_paths()
    }

    async fn pipeline_info(
        &self,
        rec: &PipelineRecord,
        status: Option<&StatusRecord>,
    ) -> Map<String, JsonValue> {
        let mut info = Map::new();

        // A record whose params cannot be decoded renders as a stub so one
        // corrupt pipeline doesn't take down the whole tree view.
        let params = match self.load_param_record(rec).await {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(pipeline_id = %rec.id, error = %err, "rendering stub for undecodable params");
                info.insert("classPath".to_string(), json!(""));
                info.insert("status".to_string(), json!("error"));
                return info;
            }
        };

        info.insert("classPath".to_string(), json!(rec.class_path));
        info.insert("status".to_string(), json!(rec.status.as_str()));
        info.insert("rootPipelineId".to_string(), json!(rec.root_pipeline_id.to_string()));
        info.insert("startTimeMs".to_string(), time_ms(rec.start_time));
        info.insert("endTimeMs".to_string(), time_ms(rec.finalized_time));
        info.insert(
            "args".to_string(),
            json!(params.args.iter().map(argument_info).collect::<Vec<_>>()),
        );
        info.insert(
            "kwargs".to_string(),
            json!(params
                .kwargs
                .iter()
                .map(|(name, arg)| (name.clone(), argument_info(arg)))
                .collect::<Map<String, JsonValue>>()),
        );
        info.insert(
            "outputs".to_string(),
            json!(params
                .output_slots
                .iter()
                .map(|(name, key)| (name.clone(), json!(key.to_string())))
                .collect::<Map<String, JsonValue>>()),
        );
        info.insert(
            "afterSlotKeys".to_string(),
            json!(params
                .after_all
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()),
        );
        info.insert(
            "children".to_string(),
            json!(rec
                .fanned_out
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()),
        );
        info.insert("queueName".to_string(), json!(params.queue_name));
        info.insert("target".to_string(), json!(params.target));
        info.insert("currentAttempt".to_string(), json!(rec.current_attempt));
        info.insert("maxAttempts".to_string(), json!(rec.max_attempts));
        info.insert("backoffSeconds".to_string(), json!(params.backoff_seconds));
        info.insert("backoffFactor".to_string(), json!(params.backoff_factor));
        info.insert("retryMessage".to_string(), json!(rec.retry_message));
        if rec.is_root_pipeline {
            info.insert("abortMessage".to_string(), json!(rec.abort_message));
            info.insert("abortRequested".to_string(), json!(rec.abort_requested));
        }
        if let Some(status) = status {
            info.insert("statusMessage".to_string(), json!(status.message));
            info.insert("statusConsoleUrl".to_string(), json!(status.console_url));
            info.insert(
                "statusLinks".to_string(),
                json!(status
                    .links
                    .iter()
                    .map(|link| (link.name.clone(), json!(link.url)))
                    .collect::<Map<String, JsonValue>>()),
            );
            info.insert(
                "statusTimeMs".to_string(),
                time_ms(Some(status.status_time)),
            );
        }
        info
    }

    async fn slot_info(&self, slot: &SlotRecord) -> JsonValue {
        let value = match (&slot.status, &slot.value) {
            (SlotStatus::Filled, Some(doc)) => match self.codec().read_value(doc).await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(slot_key = %slot.id, error = %err, "slot value undecodable");
                    JsonValue::Null
                }
            },
            _ => JsonValue::Null,
        };
        json!({
            "status": match slot.status {
                SlotStatus::Filled => "filled",
                SlotStatus::Waiting => "waiting",
            },
            "value": value,
            "fillTimeMs": time_ms(slot.fill_time),
            "fillerPipelineId": slot.filler.map(|id| id.to_string()),
        })
    }
}
