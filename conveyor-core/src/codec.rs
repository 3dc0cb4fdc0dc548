//! Canonical JSON encoding for arguments and slot values.
//!
//! One representation is used for every persisted payload. Datetimes and
//! raw bytes have no native JSON form, so they are written as single-key
//! objects with a distinguishing tag; the decoder restores them. Payloads
//! larger than the inline threshold are offloaded to the blob store and the
//! record keeps only the handle.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::CodecError;
use crate::types::ValueDocument;

/// Tag key for datetimes: `{"__datetime__": "<rfc3339, micros>"}`.
pub const DATETIME_TAG: &str = "__datetime__";

/// Tag key for binary payloads: `{"__bytes__": "<base64>"}`.
pub const BYTES_TAG: &str = "__bytes__";

/// Inline payloads are capped below typical store entity-size limits.
pub const MAX_INLINE_BYTES: usize = 1_000_000;

/// Wrap a datetime in its tagged JSON form.
pub fn tag_datetime(dt: DateTime<Utc>) -> JsonValue {
    json!({ DATETIME_TAG: dt.to_rfc3339_opts(SecondsFormat::Micros, true) })
}

/// Wrap bytes in their tagged JSON form.
pub fn tag_bytes(bytes: &[u8]) -> JsonValue {
    use base64::Engine as _;
    json!({ BYTES_TAG: base64::engine::general_purpose::STANDARD.encode(bytes) })
}

/// Recognize a tagged datetime.
pub fn as_datetime(value: &JsonValue) -> Option<DateTime<Utc>> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let text = obj.get(DATETIME_TAG)?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Recognize tagged bytes.
pub fn as_bytes(value: &JsonValue) -> Option<Vec<u8>> {
    use base64::Engine as _;
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let text = obj.get(BYTES_TAG)?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(text).ok()
}

/// Encode a value as canonical text. serde_json maps are ordered, so equal
/// values always produce equal text.
pub fn to_canonical_text(value: &JsonValue) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode canonical text. JSON object keys are strings by construction,
/// which covers the key-coercion requirement of the wire format.
pub fn from_canonical_text(text: &str) -> Result<JsonValue, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encoder/decoder bound to a blob store for oversized payloads.
#[derive(Clone)]
pub struct Codec {
    blobs: Arc<dyn BlobStore>,
    max_inline_bytes: usize,
}

impl Codec {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            max_inline_bytes: MAX_INLINE_BYTES,
        }
    }

    pub fn with_max_inline_bytes(mut self, max_inline_bytes: usize) -> Self {
        self.max_inline_bytes = max_inline_bytes;
        self
    }

    /// Serialize `value`, inline when small enough, otherwise offloaded to
    /// the blob store under the owning root pipeline.
    pub async fn write_value(
        &self,
        root_pipeline_id: Uuid,
        value: &JsonValue,
    ) -> Result<ValueDocument, CodecError> {
        let text = to_canonical_text(value)?;
        if text.len() <= self.max_inline_bytes {
            return Ok(ValueDocument::inline(text));
        }

        let key = format!("{}/{}", root_pipeline_id, Uuid::now_v7());
        let handle = self.blobs.store(&key, text.as_bytes()).await?;
        tracing::debug!(root_pipeline_id = %root_pipeline_id, handle = %handle,
            size = text.len(), "offloaded oversized payload to blob store");
        Ok(ValueDocument::blob(handle))
    }

    /// Read a value document back, following the blob handle if present.
    pub async fn read_value(&self, doc: &ValueDocument) -> Result<JsonValue, CodecError> {
        if let Some(text) = &doc.inline_text {
            return from_canonical_text(text);
        }
        if let Some(handle) = &doc.blob_handle {
            let bytes = self.blobs.fetch(handle).await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        Err(CodecError::EmptyDocument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use chrono::TimeZone;

    fn codec() -> Codec {
        Codec::new(Arc::new(MemoryBlobStore::new()))
    }

    #[test]
    fn test_datetime_tag_round_trip() {
        let dt = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 45).unwrap();
        let tagged = tag_datetime(dt);
        assert_eq!(as_datetime(&tagged), Some(dt));

        // A plain object with extra keys is not a tagged datetime.
        let not_tagged = json!({ DATETIME_TAG: "2021-06-01T12:30:45Z", "extra": 1 });
        assert_eq!(as_datetime(&not_tagged), None);
    }

    #[test]
    fn test_bytes_tag_round_trip() {
        let payload = vec![0u8, 1, 2, 255];
        let tagged = tag_bytes(&payload);
        assert_eq!(as_bytes(&tagged), Some(payload));
    }

    #[test]
    fn test_canonical_text_is_stable() {
        let a = json!({"b": 1, "a": [true, null, "x"]});
        let b = json!({"a": [true, null, "x"], "b": 1});
        assert_eq!(
            to_canonical_text(&a).unwrap(),
            to_canonical_text(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_small_value_stays_inline() {
        let codec = codec();
        let value = json!({"k": "v"});
        let doc = codec.write_value(Uuid::now_v7(), &value).await.unwrap();
        assert!(doc.inline_text.is_some());
        assert!(doc.blob_handle.is_none());
        assert_eq!(codec.read_value(&doc).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_large_value_offloads_to_blob() {
        let codec = codec().with_max_inline_bytes(64);
        let value = json!("x".repeat(200));
        let doc = codec.write_value(Uuid::now_v7(), &value).await.unwrap();
        assert!(doc.inline_text.is_none());
        assert!(doc.blob_handle.is_some());
        assert_eq!(codec.read_value(&doc).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_empty_document_is_an_error() {
        let codec = codec();
        let doc = ValueDocument {
            inline_text: None,
            blob_handle: None,
        };
        assert!(matches!(
            codec.read_value(&doc).await,
            Err(CodecError::EmptyDocument)
        ));
    }
}
