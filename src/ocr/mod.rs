//! OCR provider adapters.
//!
//! Both providers implement one capability interface, selected by
//! configuration. The orchestrator never branches on which one is active.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{error::PipelineError, prelude::*, storage::ObjectStore};

use self::block::{Block, KeyValuePair, OcrConfidence, TableExtract};

pub mod block;
pub mod textract;
pub mod vision;

/// The OCR providers we can run against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum OcrProvider {
    /// AWS Textract document analysis (forms + tables).
    #[default]
    Textract,

    /// Google Vision text detection. No form or table structuring.
    Vision,
}

/// Options shared by OCR engines.
#[derive(Clone, Debug)]
pub struct OcrOpts {
    /// Bucket holding uploads and OCR scratch objects.
    pub bucket: String,

    /// Key prefix for uploaded documents.
    pub key_prefix: String,

    /// Total budget for waiting on an asynchronous OCR job.
    pub max_wait: Duration,

    /// Maximum OCR job starts per second.
    pub starts_per_second: usize,
}

impl Default for OcrOpts {
    fn default() -> Self {
        Self {
            bucket: "coi-documents".to_owned(),
            key_prefix: "uploads".to_owned(),
            max_wait: Duration::from_secs(150),
            starts_per_second: 2,
        }
    }
}

/// Interface to an OCR provider: PDF bytes in, normalized structures out.
#[async_trait]
pub trait DocumentOcrEngine: Send + Sync + 'static {
    /// The provider name recorded on documents and parse results.
    fn provider_name(&self) -> &'static str;

    /// Run the provider's full pipeline: upload, analyze, poll, paginate,
    /// and normalize. `key_hint` becomes part of the storage key so operators
    /// can trace an object back to its document.
    async fn normalize_document(
        &self,
        pdf: &[u8],
        key_hint: &str,
    ) -> Result<NormalizedDocument, PipelineError>;
}

/// Normalized output of a provider run.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct NormalizedDocument {
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    pub job_status: String,

    /// URI of the uploaded input object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_location: Option<String>,

    pub full_text: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_value_pairs: Vec<KeyValuePair>,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub key_values_best: HashMap<String, String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableExtract>,

    pub confidence: OcrConfidence,

    pub meta: OcrMeta,
}

/// Provider-reported diagnostics, carried into parse provenance.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct OcrMeta {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_metadata: Option<Value>,
}

/// Build the configured OCR engine.
pub async fn ocr_engine_for_provider(
    provider: OcrProvider,
    store: Arc<dyn ObjectStore>,
    opts: OcrOpts,
) -> Result<Arc<dyn DocumentOcrEngine>> {
    match provider {
        OcrProvider::Textract => {
            Ok(textract::TextractOcrEngine::from_env(store, opts).await?)
        }
        OcrProvider::Vision => Ok(vision::VisionOcrEngine::from_env(store, opts)?),
    }
}

/// Build a collision-resistant storage key: prefix, timestamp, random
/// suffix, and the caller's hint.
pub(crate) fn object_key(prefix: &str, hint: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple();
    format!("{prefix}/{timestamp}-{suffix}-{hint}.pdf")
}

/// Delay before poll `idx` (0-indexed): 1s, 2s, 3s, then capped at 5s.
pub(crate) fn poll_delay(idx: u32) -> Duration {
    Duration::from_secs(u64::from(idx + 1).min(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_delays_increase_then_cap() {
        let secs = (0..6).map(|i| poll_delay(i).as_secs()).collect::<Vec<_>>();
        assert_eq!(secs, vec![1, 2, 3, 4, 5, 5]);
    }

    #[test]
    fn object_keys_are_unique_and_carry_the_hint() {
        let a = object_key("uploads", "carrier-42-doc-7");
        let b = object_key("uploads", "carrier-42-doc-7");
        assert_ne!(a, b);
        assert!(a.starts_with("uploads/"));
        assert!(a.ends_with("-carrier-42-doc-7.pdf"));
    }
}
