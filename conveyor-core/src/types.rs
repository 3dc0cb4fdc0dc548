use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Statuses ─────────────────────────────────────────────────

/// Lifecycle of a pipeline (one stage instance).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Waiting,
    Run,
    Done,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Run => "run",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A slot moves WAITING → FILLED at most once in observable effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Waiting,
    Filled,
}

/// Once FIRED, a barrier stays FIRED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierStatus {
    Waiting,
    Fired,
}

/// What firing the barrier should do to its target pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierPurpose {
    Start,
    Finalize,
    Abort,
}

impl BarrierPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Finalize => "finalize",
            Self::Abort => "abort",
        }
    }
}

impl std::str::FromStr for BarrierPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "finalize" => Ok(Self::Finalize),
            "abort" => Ok(Self::Abort),
            _ => Err(format!("unknown barrier purpose: {s}")),
        }
    }
}

impl std::fmt::Display for BarrierPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── Value documents ──────────────────────────────────────────

/// A persisted payload: either inline canonical JSON or a blob handle.
/// Exactly one of the two fields is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueDocument {
    pub inline_text: Option<String>,
    pub blob_handle: Option<String>,
}

impl ValueDocument {
    pub fn inline(text: String) -> Self {
        Self {
            inline_text: Some(text),
            blob_handle: None,
        }
    }

    pub fn blob(handle: String) -> Self {
        Self {
            inline_text: None,
            blob_handle: Some(handle),
        }
    }
}

// ─── Retry parameters ─────────────────────────────────────────

/// Per-stage retry knobs, persisted in the parameter record.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryParams {
    pub max_attempts: u32,
    pub backoff_seconds: f64,
    pub backoff_factor: f64,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: 15.0,
            backoff_factor: 2.0,
        }
    }
}

// ─── Parameter record ─────────────────────────────────────────

/// A positional or keyword argument leaf: a concrete value, or a reference
/// to another stage's output slot resolved at run time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArgumentRef {
    Value { value: JsonValue },
    Slot { slot_key: Uuid },
}

impl ArgumentRef {
    pub fn slot_key(&self) -> Option<Uuid> {
        match self {
            Self::Slot { slot_key } => Some(*slot_key),
            Self::Value { .. } => None,
        }
    }
}

/// The serialized parameter dictionary stored in `PipelineRecord.params`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamRecord {
    pub class_path: String,
    pub args: Vec<ArgumentRef>,
    pub kwargs: BTreeMap<String, ArgumentRef>,
    /// Declared output slots, always including "default".
    pub output_slots: BTreeMap<String, Uuid>,
    /// Extra START dependencies beyond argument dataflow (After / InOrder).
    pub after_all: Vec<Uuid>,
    pub queue_name: String,
    pub base_path: String,
    pub target: Option<String>,
    pub max_attempts: u32,
    pub backoff_seconds: f64,
    pub backoff_factor: f64,
    /// When true, handler-level stage failures re-raise so the task queue
    /// retries the same attempt instead of the engine's backoff machinery.
    pub task_retry: bool,
    /// Enqueue a cleanup task automatically when the root finalizes.
    #[serde(default)]
    pub cleanup_on_done: bool,
}

impl ParamRecord {
    pub fn retry_params(&self) -> RetryParams {
        RetryParams {
            max_attempts: self.max_attempts,
            backoff_seconds: self.backoff_seconds,
            backoff_factor: self.backoff_factor,
        }
    }

    /// All slot keys this stage's start depends on: argument dataflow
    /// plus the explicit after_all set.
    pub fn blocking_slots(&self) -> Vec<Uuid> {
        let mut keys: Vec<Uuid> = self
            .args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(ArgumentRef::slot_key)
            .collect();
        keys.extend(self.after_all.iter().copied());
        keys.sort();
        keys.dedup();
        keys
    }
}

// ─── Records ──────────────────────────────────────────────────

/// One stage instance. The record id doubles as the stage's pipeline id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub class_path: String,
    pub root_pipeline_id: Uuid,
    pub is_root_pipeline: bool,
    pub params: ValueDocument,
    /// Direct children in yield order; written exactly once, when a
    /// generator transitions WAITING → RUN.
    pub fanned_out: Vec<Uuid>,
    pub status: PipelineStatus,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub retry_message: Option<String>,
    /// Root-only: why the whole workflow was aborted.
    pub abort_message: Option<String>,
    /// Root-only: an abort sweep has been requested.
    pub abort_requested: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub finalized_time: Option<DateTime<Utc>>,
}

/// Single-assignment output cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: Uuid,
    pub root_pipeline_id: Uuid,
    /// Pipeline that filled this slot.
    pub filler: Option<Uuid>,
    pub value: Option<ValueDocument>,
    pub status: SlotStatus,
    pub fill_time: Option<DateTime<Utc>>,
}

/// Fires its target when every blocking slot is FILLED.
/// Keyed by (target_pipeline_id, purpose).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BarrierRecord {
    pub target_pipeline_id: Uuid,
    pub purpose: BarrierPurpose,
    pub root_pipeline_id: Uuid,
    pub blocking_slots: Vec<Uuid>,
    pub status: BarrierStatus,
    pub trigger_time: Option<DateTime<Utc>>,
}

/// Key-only record: "slot X blocks the (target, purpose) barrier".
/// Written in the same transaction as the barrier it indexes so that
/// fan-out from a slot fill is strongly consistent even on stores whose
/// property indexes are not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BarrierIndexEntry {
    pub slot_id: Uuid,
    pub target_pipeline_id: Uuid,
    pub purpose: BarrierPurpose,
    pub root_pipeline_id: Uuid,
}

/// A named link shown next to a pipeline in the status UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusLink {
    pub name: String,
    pub url: String,
}

/// Advisory, human-facing status written by `set_status`. Never consulted
/// by the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusRecord {
    pub pipeline_id: Uuid,
    pub root_pipeline_id: Uuid,
    pub message: Option<String>,
    pub console_url: Option<String>,
    pub links: Vec<StatusLink>,
    pub status_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_status_terminal() {
        assert!(!PipelineStatus::Waiting.is_terminal());
        assert!(!PipelineStatus::Run.is_terminal());
        assert!(PipelineStatus::Done.is_terminal());
        assert!(PipelineStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_barrier_purpose_round_trip() {
        for purpose in [
            BarrierPurpose::Start,
            BarrierPurpose::Finalize,
            BarrierPurpose::Abort,
        ] {
            assert_eq!(purpose.as_str().parse::<BarrierPurpose>(), Ok(purpose));
        }
        assert!("bogus".parse::<BarrierPurpose>().is_err());
    }

    #[test]
    fn test_argument_ref_serde_tags() {
        let value = ArgumentRef::Value {
            value: serde_json::json!([1, 2, 3]),
        };
        let encoded = serde_json::to_value(&value).unwrap();
        assert_eq!(encoded["type"], "value");

        let slot = ArgumentRef::Slot {
            slot_key: Uuid::now_v7(),
        };
        let encoded = serde_json::to_value(&slot).unwrap();
        assert_eq!(encoded["type"], "slot");
        let decoded: ArgumentRef = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, slot);
    }

    #[test]
    fn test_blocking_slots_dedupes_dataflow_and_after_all() {
        let shared = Uuid::now_v7();
        let other = Uuid::now_v7();
        let params = ParamRecord {
            class_path: "demo.Stage".to_string(),
            args: vec![
                ArgumentRef::Value {
                    value: serde_json::json!(1),
                },
                ArgumentRef::Slot { slot_key: shared },
            ],
            kwargs: BTreeMap::from([(
                "x".to_string(),
                ArgumentRef::Slot { slot_key: other },
            )]),
            output_slots: BTreeMap::new(),
            after_all: vec![shared],
            queue_name: "default".to_string(),
            base_path: "/_ah/pipeline".to_string(),
            target: None,
            max_attempts: 3,
            backoff_seconds: 15.0,
            backoff_factor: 2.0,
            task_retry: false,
            cleanup_on_done: false,
        };

        let blocking = params.blocking_slots();
        assert_eq!(blocking.len(), 2);
        assert!(blocking.contains(&shared));
        assert!(blocking.contains(&other));
    }
}
