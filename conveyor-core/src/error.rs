use thiserror::Error;
use uuid::Uuid;

use crate::blob::BlobStoreError;

/// Errors raised while encoding or decoding persisted payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blob store: {0}")]
    Blob(#[from] BlobStoreError),

    #[error("value document has neither inline text nor a blob handle")]
    EmptyDocument,
}

/// The error taxonomy shared by stage authors and the engine.
///
/// `Retry` and `Abort` are control-flow values a stage raises on purpose;
/// everything else is treated as a retryable stage failure until the attempt
/// budget is exhausted, at which point the whole workflow is aborted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stage author explicitly requested a retry with backoff.
    #[error("{0}")]
    Retry(String),

    /// Stage author requested a whole-workflow abort.
    #[error("{0}")]
    Abort(String),

    #[error("slot {0} has not been filled")]
    SlotNotFilled(Uuid),

    #[error("output '{name}' is not declared by {class_path}")]
    SlotNotDeclared { class_path: String, name: String },

    /// Misuse detected while starting a pipeline; nothing was persisted.
    #[error("pipeline setup: {0}")]
    Setup(String),

    #[error("pipeline {0} already exists")]
    PipelineExists(Uuid),

    #[error("no stage registered for class path '{0}'")]
    UnknownClassPath(String),

    #[error(transparent)]
    Serialization(#[from] CodecError),

    /// Anything else a stage body fails with.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        EngineError::Other(msg.into())
    }
}
