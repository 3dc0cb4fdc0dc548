use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{SlotRecord, SlotStatus};

/// Read-side handle over one output slot. Identity (the key) exists whether
/// or not a value does; value accessors fail until the slot is FILLED.
#[derive(Clone, Debug)]
pub struct Slot {
    key: Uuid,
    status: SlotStatus,
    value: Option<JsonValue>,
    filler: Option<Uuid>,
    fill_time: Option<DateTime<Utc>>,
}

impl Slot {
    /// A slot known only by key, not yet loaded or not yet persisted.
    pub fn unfilled(key: Uuid) -> Self {
        Self {
            key,
            status: SlotStatus::Waiting,
            value: None,
            filler: None,
            fill_time: None,
        }
    }

    /// Build from a loaded record and its decoded value.
    pub fn from_record(record: &SlotRecord, value: Option<JsonValue>) -> Self {
        Self {
            key: record.id,
            status: record.status,
            value,
            filler: record.filler,
            fill_time: record.fill_time,
        }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn filled(&self) -> bool {
        self.status == SlotStatus::Filled
    }

    pub fn value(&self) -> Result<&JsonValue, EngineError> {
        if !self.filled() {
            return Err(EngineError::SlotNotFilled(self.key));
        }
        self.value
            .as_ref()
            .ok_or(EngineError::SlotNotFilled(self.key))
    }

    pub fn filler(&self) -> Result<Uuid, EngineError> {
        self.filler.ok_or(EngineError::SlotNotFilled(self.key))
    }

    pub fn fill_time(&self) -> Result<DateTime<Utc>, EngineError> {
        self.fill_time.ok_or(EngineError::SlotNotFilled(self.key))
    }
}

/// The named outputs of a finished (or inspected) pipeline.
#[derive(Clone, Debug, Default)]
pub struct Outputs {
    slots: BTreeMap<String, Slot>,
}

impl Outputs {
    pub fn new(slots: BTreeMap<String, Slot>) -> Self {
        Self { slots }
    }

    pub fn get(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    pub fn default_slot(&self) -> Option<&Slot> {
        self.slots.get(crate::future::DEFAULT_OUTPUT)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.slots.iter().map(|(name, slot)| (name.as_str(), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfilled_reads_fail() {
        let slot = Slot::unfilled(Uuid::now_v7());
        assert!(!slot.filled());
        assert!(matches!(slot.value(), Err(EngineError::SlotNotFilled(_))));
        assert!(matches!(slot.filler(), Err(EngineError::SlotNotFilled(_))));
        assert!(matches!(
            slot.fill_time(),
            Err(EngineError::SlotNotFilled(_))
        ));
    }

    #[test]
    fn test_filled_reads_succeed() {
        let record = SlotRecord {
            id: Uuid::now_v7(),
            root_pipeline_id: Uuid::now_v7(),
            filler: Some(Uuid::now_v7()),
            value: None,
            status: SlotStatus::Filled,
            fill_time: Some(Utc::now()),
        };
        let slot = Slot::from_record(&record, Some(serde_json::json!([1, 2, 3])));
        assert!(slot.filled());
        assert_eq!(slot.value().unwrap(), &serde_json::json!([1, 2, 3]));
        assert_eq!(slot.filler().unwrap(), record.filler.unwrap());
    }
}
