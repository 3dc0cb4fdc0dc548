//! Stage futures: the handle a generator receives when it yields a child.
//!
//! A future exposes the child's output slots before any of them exist in
//! the store. A future is *strict* when the stage class declares output
//! names (exactly `{"default"} ∪ output_names` slots are pre-allocated and
//! anything else is rejected) and *loose* otherwise (undeclared names
//! materialize lazily on first access).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::EngineError;

/// Name of the implicit output slot every stage has.
pub const DEFAULT_OUTPUT: &str = "default";

/// Lightweight reference to an output slot, used to wire child arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotHandle {
    key: Uuid,
}

impl SlotHandle {
    pub(crate) fn new(key: Uuid) -> Self {
        Self { key }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }
}

struct FutureInner {
    class_path: String,
    strict: bool,
    declared: BTreeSet<String>,
    slots: BTreeMap<String, Uuid>,
    /// Slot keys adopted from a parent; these records already exist and
    /// must not be created again when the child graph commits.
    inherited: BTreeSet<Uuid>,
}

/// Handle over one stage instantiation's output slots.
///
/// Clones share state: lazily-materialized slots are visible to the child
/// graph builder that will persist them.
#[derive(Clone)]
pub struct StageFuture {
    inner: Arc<Mutex<FutureInner>>,
}

impl StageFuture {
    /// Allocate fresh slot keys for `default` plus every declared name.
    pub fn new(class_path: impl Into<String>, output_names: &[String]) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(DEFAULT_OUTPUT.to_string(), Uuid::now_v7());
        let mut declared = BTreeSet::new();
        declared.insert(DEFAULT_OUTPUT.to_string());
        for name in output_names {
            declared.insert(name.clone());
            slots.insert(name.clone(), Uuid::now_v7());
        }
        Self {
            inner: Arc::new(Mutex::new(FutureInner {
                class_path: class_path.into(),
                strict: !output_names.is_empty(),
                declared,
                slots,
                inherited: BTreeSet::new(),
            })),
        }
    }

    /// Rebuild a future over slots that already exist in the store (the
    /// running stage's own outputs, from its parameter record).
    pub fn from_existing(
        class_path: impl Into<String>,
        output_names: &[String],
        slots: &BTreeMap<String, Uuid>,
    ) -> Self {
        let mut declared = BTreeSet::new();
        declared.insert(DEFAULT_OUTPUT.to_string());
        for name in output_names {
            declared.insert(name.clone());
        }
        Self {
            inner: Arc::new(Mutex::new(FutureInner {
                class_path: class_path.into(),
                strict: !output_names.is_empty(),
                declared,
                slots: slots.clone(),
                inherited: slots.values().copied().collect(),
            })),
        }
    }

    pub fn class_path(&self) -> String {
        self.inner.lock().unwrap().class_path.clone()
    }

    /// The default output slot.
    pub fn default_output(&self) -> SlotHandle {
        self.output(DEFAULT_OUTPUT)
            .expect("default output always exists")
    }

    /// A named output slot. Loose futures materialize unknown names;
    /// strict futures reject them.
    pub fn output(&self, name: &str) -> Result<SlotHandle, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.slots.get(name) {
            return Ok(SlotHandle::new(*key));
        }
        if inner.strict {
            return Err(EngineError::SlotNotDeclared {
                class_path: inner.class_path.clone(),
                name: name.to_string(),
            });
        }
        let key = Uuid::now_v7();
        inner.slots.insert(name.to_string(), key);
        Ok(SlotHandle::new(key))
    }

    /// Adopt a parent's slot keys so this child writes directly into them.
    ///
    /// Every inherited name must be accessible under this future's
    /// declaration rules; a strict child that lacks a parent output name is
    /// a stage-authoring error.
    pub fn inherit_outputs(
        &self,
        outputs: &BTreeMap<String, Uuid>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        for (name, key) in outputs {
            if inner.strict && !inner.declared.contains(name) && name != DEFAULT_OUTPUT {
                return Err(EngineError::SlotNotDeclared {
                    class_path: inner.class_path.clone(),
                    name: name.clone(),
                });
            }
            inner.slots.insert(name.clone(), *key);
            inner.inherited.insert(*key);
        }
        Ok(())
    }

    /// Snapshot of name → slot key.
    pub fn slot_keys(&self) -> BTreeMap<String, Uuid> {
        self.inner.lock().unwrap().slots.clone()
    }

    /// Slot keys this future owns, i.e. those whose records still need to
    /// be created. Inherited keys are excluded.
    pub fn owned_slot_keys(&self) -> Vec<Uuid> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .values()
            .filter(|key| !inner.inherited.contains(key))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_future_materializes_names_lazily() {
        let future = StageFuture::new("demo.EchoNamed", &[]);
        let one = future.output("one").unwrap();
        let two = future.output("two").unwrap();
        assert_ne!(one.key(), two.key());
        assert_ne!(one.key(), future.default_output().key());
        // Same name resolves to the same slot.
        assert_eq!(future.output("one").unwrap().key(), one.key());
    }

    #[test]
    fn test_strict_future_rejects_undeclared_names() {
        let future = StageFuture::new(
            "demo.EchoParticular",
            &["one".to_string(), "two".to_string()],
        );
        assert!(future.output("one").is_ok());
        assert!(future.output("two").is_ok());
        let err = future.output("three").unwrap_err();
        assert!(matches!(err, EngineError::SlotNotDeclared { .. }));
        // Exactly default + declared were pre-allocated.
        assert_eq!(future.slot_keys().len(), 3);
    }

    #[test]
    fn test_inherit_outputs_replaces_keys() {
        let future = StageFuture::new("demo.Child", &[]);
        let parent_default = Uuid::now_v7();
        let parent_named = Uuid::now_v7();
        let outputs = BTreeMap::from([
            (DEFAULT_OUTPUT.to_string(), parent_default),
            ("gcd".to_string(), parent_named),
        ]);

        future.inherit_outputs(&outputs).unwrap();
        assert_eq!(future.default_output().key(), parent_default);
        assert_eq!(future.output("gcd").unwrap().key(), parent_named);

        // Inherited slots are not re-created by the builder.
        let owned = future.owned_slot_keys();
        assert!(!owned.contains(&parent_default));
        assert!(!owned.contains(&parent_named));
    }

    #[test]
    fn test_strict_child_must_declare_inherited_names() {
        let future = StageFuture::new("demo.Strict", &["gcd".to_string()]);
        let outputs = BTreeMap::from([
            (DEFAULT_OUTPUT.to_string(), Uuid::now_v7()),
            ("gcd".to_string(), Uuid::now_v7()),
            ("extra".to_string(), Uuid::now_v7()),
        ]);
        let err = future.inherit_outputs(&outputs).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SlotNotDeclared { name, .. } if name == "extra"
        ));
    }
}
