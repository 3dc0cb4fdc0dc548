//! Conveyor: a durable, distributed workflow engine.
//!
//! Workflows are trees of *stages* whose inputs, outputs, dependencies and
//! retries are persisted in a record store. Execution is driven entirely by
//! an external at-least-once task queue invoking short-lived, idempotent
//! handlers; a *barrier* fires a stage once every output slot it depends on
//! has been filled. The engine guarantees eventual progress and
//! at-most-once observable slot fills while tolerating repeated handler
//! delivery.

pub mod barrier;
pub mod blob;
pub mod builder;
pub mod codec;
pub mod engine;
pub mod error;
pub mod future;
pub mod queries;
pub mod queue;
pub mod slot;
pub mod stage;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod testing;
pub mod types;

pub use engine::{CallbackAuth, CallbackOutcome, CallbackRequest, Engine, EngineConfig, StartOptions};
pub use error::{CodecError, EngineError};
pub use future::{SlotHandle, StageFuture};
pub use slot::{Outputs, Slot};
pub use stage::{
    CallbackAccess, CallbackMode, FinalizeInfo, RunContext, Stage, StageCall, StageKind,
    StageRegistry, StatusUpdate,
};
