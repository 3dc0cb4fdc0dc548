//! Child-graph construction for generator stages.
//!
//! Draining a generator is a pure, local operation: each `spawn` collects a
//! child descriptor, ordering scopes add START dependencies, and the engine
//! turns the finished list into one transactional batch. Nothing here
//! touches the store.
//!
//! Dependency cycles cannot form: a child can only reference the future of
//! a child yielded before it, and inherited parent slots are filled from
//! outside the sibling set.

use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::EngineError;
use crate::future::StageFuture;
use crate::stage::{CallArg, StageCall};
use crate::types::{ArgumentRef, RetryParams};

/// Routing and retry defaults children inherit from their parent.
#[derive(Clone, Debug)]
pub struct ChildDefaults {
    pub queue_name: String,
    pub base_path: String,
    pub target: Option<String>,
    pub retry: RetryParams,
    pub task_retry: bool,
}

/// One yielded child, ready to be turned into records.
pub struct ChildDescriptor {
    pub pipeline_id: Uuid,
    pub class_path: String,
    pub args: Vec<ArgumentRef>,
    pub kwargs: BTreeMap<String, ArgumentRef>,
    pub future: StageFuture,
    /// START dependencies induced by After/InOrder scopes (dataflow
    /// dependencies live in `args`/`kwargs`).
    pub after_all: Vec<Uuid>,
    pub retry: RetryParams,
    pub task_retry: bool,
    pub queue_name: String,
    pub base_path: String,
    pub target: Option<String>,
}

impl ChildDescriptor {
    /// Every slot key this child's START barrier must wait on.
    pub fn blocking_slots(&self) -> Vec<Uuid> {
        let mut keys: BTreeSet<Uuid> = self
            .args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(ArgumentRef::slot_key)
            .collect();
        keys.extend(self.after_all.iter().copied());
        keys.into_iter().collect()
    }
}

struct InOrderScope {
    previous_default: Option<Uuid>,
}

/// Accumulates child descriptors and the scope-local ordering state during
/// one generator drain.
pub struct ChildGraphBuilder {
    defaults: ChildDefaults,
    children: Vec<ChildDescriptor>,
    after_stack: Vec<Vec<Uuid>>,
    in_order: Option<InOrderScope>,
}

impl ChildGraphBuilder {
    pub fn new(defaults: ChildDefaults) -> Self {
        Self {
            defaults,
            children: Vec::new(),
            after_stack: Vec::new(),
            in_order: None,
        }
    }

    pub fn push_after(&mut self, keys: Vec<Uuid>) {
        self.after_stack.push(keys);
    }

    pub fn pop_after(&mut self) {
        self.after_stack.pop();
    }

    pub fn enter_in_order(&mut self) -> Result<(), EngineError> {
        if self.in_order.is_some() {
            return Err(EngineError::Setup(
                "InOrder may not be nested inside another InOrder".to_string(),
            ));
        }
        self.in_order = Some(InOrderScope {
            previous_default: None,
        });
        Ok(())
    }

    pub fn exit_in_order(&mut self) {
        self.in_order = None;
    }

    pub fn spawn(
        &mut self,
        call: StageCall,
        output_names: Vec<String>,
    ) -> Result<StageFuture, EngineError> {
        let future = StageFuture::new(call.class_path.clone(), &output_names);

        let mut after_all: BTreeSet<Uuid> = self.after_stack.iter().flatten().copied().collect();
        if let Some(scope) = &self.in_order {
            if let Some(prev) = scope.previous_default {
                after_all.insert(prev);
            }
        }

        let args = call.args.iter().map(call_arg_to_ref).collect();
        let kwargs = call
            .kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), call_arg_to_ref(arg)))
            .collect();

        let descriptor = ChildDescriptor {
            pipeline_id: Uuid::now_v7(),
            class_path: call.class_path.clone(),
            args,
            kwargs,
            future: future.clone(),
            after_all: after_all.into_iter().collect(),
            retry: call.retry_params(self.defaults.retry),
            task_retry: call.task_retry.unwrap_or(self.defaults.task_retry),
            queue_name: call
                .queue_name
                .clone()
                .unwrap_or_else(|| self.defaults.queue_name.clone()),
            base_path: self.defaults.base_path.clone(),
            target: call.target.clone().or_else(|| self.defaults.target.clone()),
        };
        self.children.push(descriptor);

        if let Some(scope) = &mut self.in_order {
            scope.previous_default = Some(future.default_output().key());
        }

        Ok(future)
    }

    pub fn take_children(&mut self) -> Vec<ChildDescriptor> {
        std::mem::take(&mut self.children)
    }
}

fn call_arg_to_ref(arg: &CallArg) -> ArgumentRef {
    match arg {
        CallArg::Value(value) => ArgumentRef::Value {
            value: value.clone(),
        },
        CallArg::Slot(slot_key) => ArgumentRef::Slot {
            slot_key: *slot_key,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ChildDefaults {
        ChildDefaults {
            queue_name: "default".to_string(),
            base_path: "/_ah/pipeline".to_string(),
            target: None,
            retry: RetryParams::default(),
            task_retry: false,
        }
    }

    fn spawn(builder: &mut ChildGraphBuilder, class_path: &str) -> StageFuture {
        builder
            .spawn(StageCall::new(class_path), Vec::new())
            .unwrap()
    }

    #[test]
    fn test_children_keep_yield_order() {
        let mut builder = ChildGraphBuilder::new(defaults());
        spawn(&mut builder, "demo.A");
        spawn(&mut builder, "demo.B");
        spawn(&mut builder, "demo.C");

        let children = builder.take_children();
        let paths: Vec<&str> = children.iter().map(|c| c.class_path.as_str()).collect();
        assert_eq!(paths, vec!["demo.A", "demo.B", "demo.C"]);
    }

    #[test]
    fn test_after_scope_blocks_later_children() {
        let mut builder = ChildGraphBuilder::new(defaults());
        let first = spawn(&mut builder, "demo.First");

        builder.push_after(vec![first.default_output().key()]);
        spawn(&mut builder, "demo.Second");
        builder.pop_after();

        spawn(&mut builder, "demo.Third");

        let children = builder.take_children();
        assert!(children[0].after_all.is_empty());
        assert_eq!(children[1].after_all, vec![first.default_output().key()]);
        assert!(children[2].after_all.is_empty());
    }

    #[test]
    fn test_in_order_chains_on_previous_default() {
        let mut builder = ChildGraphBuilder::new(defaults());
        builder.enter_in_order().unwrap();
        let a = spawn(&mut builder, "demo.A");
        let b = spawn(&mut builder, "demo.B");
        spawn(&mut builder, "demo.C");
        builder.exit_in_order();

        let children = builder.take_children();
        assert!(children[0].after_all.is_empty());
        assert_eq!(children[1].after_all, vec![a.default_output().key()]);
        assert_eq!(children[2].after_all, vec![b.default_output().key()]);
    }

    #[test]
    fn test_in_order_does_not_nest() {
        let mut builder = ChildGraphBuilder::new(defaults());
        builder.enter_in_order().unwrap();
        let err = builder.enter_in_order().unwrap_err();
        assert!(matches!(err, EngineError::Setup(_)));
    }

    #[test]
    fn test_dataflow_and_scope_deps_combine() {
        let mut builder = ChildGraphBuilder::new(defaults());
        let first = spawn(&mut builder, "demo.First");
        let gate = spawn(&mut builder, "demo.Gate");

        let first_default = first.default_output();
        builder.push_after(vec![gate.default_output().key()]);
        builder
            .spawn(
                StageCall::new("demo.Consumer").arg_slot(&first_default),
                Vec::new(),
            )
            .unwrap();
        builder.pop_after();

        let children = builder.take_children();
        let blocking = children[2].blocking_slots();
        assert!(blocking.contains(&first.default_output().key()));
        assert!(blocking.contains(&gate.default_output().key()));
        assert_eq!(blocking.len(), 2);
    }

    #[test]
    fn test_retry_overrides_fall_back_to_defaults() {
        let mut builder = ChildGraphBuilder::new(defaults());
        builder
            .spawn(
                StageCall::new("demo.Retryable")
                    .max_attempts(5)
                    .backoff_seconds(1.0),
                Vec::new(),
            )
            .unwrap();

        let children = builder.take_children();
        assert_eq!(children[0].retry.max_attempts, 5);
        assert_eq!(children[0].retry.backoff_seconds, 1.0);
        assert_eq!(children[0].retry.backoff_factor, 2.0);
    }
}
