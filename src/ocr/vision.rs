//! OCR using Google Vision asynchronous text detection.
//!
//! The fallback provider: plain page text and per-page confidences, no form
//! or table structuring. Vision writes its results as JSON objects next to
//! the uploaded document, which we read back through the object store.

use std::{env, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::time;

use crate::{
    error::PipelineError,
    prelude::*,
    retry::{RetryOpts, with_retries},
    storage::ObjectStore,
};

use super::{
    DocumentOcrEngine, NormalizedDocument, OcrMeta, OcrOpts,
    block::OcrConfidence,
    object_key, poll_delay,
};

const VISION_ENDPOINT: &str = "https://vision.googleapis.com/v1";

/// How many PDF pages Vision batches into each output object.
const OUTPUT_BATCH_SIZE: u32 = 20;

/// How many result objects to read back concurrently.
const READBACK_CONCURRENCY: usize = 4;

/// OCR engine wrapping the Google Vision `files:asyncBatchAnnotate` API.
pub struct VisionOcrEngine {
    http: reqwest::Client,
    api_key: String,
    store: Arc<dyn ObjectStore>,
    opts: OcrOpts,
    retry: RetryOpts,
}

impl VisionOcrEngine {
    /// Create an engine using `GOOGLE_VISION_API_KEY` credentials.
    pub fn from_env(
        store: Arc<dyn ObjectStore>,
        opts: OcrOpts,
    ) -> Result<Arc<dyn DocumentOcrEngine>> {
        let api_key = env::var("GOOGLE_VISION_API_KEY")
            .context("GOOGLE_VISION_API_KEY must be set for the vision provider")?;
        Ok(Arc::new(Self {
            http: reqwest::Client::new(),
            api_key,
            store,
            opts,
            retry: RetryOpts::default(),
        }))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, PipelineError> {
        let response = with_retries(&self.retry, || async {
            self.http
                .post(url)
                .query(&[("key", self.api_key.as_str())])
                .json(body)
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|err| {
            PipelineError::Other(anyhow::Error::new(err).context("vision request failed"))
        })?;
        response.json().await.map_err(|err| {
            PipelineError::Other(
                anyhow::Error::new(err).context("vision response was not JSON"),
            )
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, PipelineError> {
        let response = with_retries(&self.retry, || async {
            self.http
                .get(url)
                .query(&[("key", self.api_key.as_str())])
                .send()
                .await?
                .error_for_status()
        })
        .await
        .map_err(|err| {
            PipelineError::Other(anyhow::Error::new(err).context("vision request failed"))
        })?;
        response.json().await.map_err(|err| {
            PipelineError::Other(
                anyhow::Error::new(err).context("vision response was not JSON"),
            )
        })
    }

    /// Poll the long-running operation until `done`, within the wait budget.
    async fn await_operation(&self, name: &str) -> Result<Value, PipelineError> {
        let url = format!("{VISION_ENDPOINT}/{name}");
        let started = Instant::now();
        let mut poll_idx = 0u32;
        loop {
            if started.elapsed() > self.opts.max_wait {
                return Err(PipelineError::Timeout {
                    elapsed_secs: started.elapsed().as_secs(),
                    last_status: "RUNNING".to_owned(),
                });
            }
            let operation = self.get_json(&url).await?;
            if let Some(error) = operation.get("error") {
                return Err(PipelineError::RemoteFailure(format!(
                    "vision operation {name} failed: {error}"
                )));
            }
            if operation.get("done").and_then(Value::as_bool) == Some(true) {
                return Ok(operation);
            }
            time::sleep(poll_delay(poll_idx)).await;
            poll_idx += 1;
        }
    }
}

#[async_trait]
impl DocumentOcrEngine for VisionOcrEngine {
    fn provider_name(&self) -> &'static str {
        "vision"
    }

    #[instrument(level = "debug", skip_all, fields(%key_hint))]
    async fn normalize_document(
        &self,
        pdf: &[u8],
        key_hint: &str,
    ) -> Result<NormalizedDocument, PipelineError> {
        if pdf.is_empty() {
            return Err(PipelineError::Validation(
                "document buffer is empty".to_owned(),
            ));
        }

        let key = object_key(&self.opts.key_prefix, key_hint);
        self.store
            .put(&self.opts.bucket, &key, pdf.to_vec(), "application/pdf")
            .await?;
        let output_prefix = format!("{key}.vision/");

        // Start the batch text-detection job.
        let request = serde_json::json!({
            "requests": [{
                "inputConfig": {
                    "gcsSource": { "uri": format!("gs://{}/{}", self.opts.bucket, key) },
                    "mimeType": "application/pdf",
                },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "outputConfig": {
                    "gcsDestination": {
                        "uri": format!("gs://{}/{}", self.opts.bucket, output_prefix),
                    },
                    "batchSize": OUTPUT_BATCH_SIZE,
                },
            }],
        });
        let started = self
            .post_json(&format!("{VISION_ENDPOINT}/files:asyncBatchAnnotate"), &request)
            .await?;
        let operation_name = started
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                PipelineError::RemoteFailure(
                    "vision returned no operation name".to_owned(),
                )
            })?;
        info!(%operation_name, %key, "started vision batch annotation");

        self.await_operation(&operation_name).await?;

        // Read back the per-batch result objects, keeping page order, and
        // stitch pages together.
        let result_keys = self.store.list(&self.opts.bucket, &output_prefix).await?;
        let results = futures::stream::iter(result_keys.iter().cloned())
            .map(|result_key| async move {
                let bytes = self.store.get(&self.opts.bucket, &result_key).await?;
                serde_json::from_slice::<Value>(&bytes).map_err(|err| {
                    PipelineError::RemoteFailure(format!(
                        "vision output {result_key} was not valid JSON: {err}"
                    ))
                })
            })
            .buffered(READBACK_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await?;
        let mut pages = vec![];
        let mut confidences = vec![];
        for result in results {
            let responses = result
                .get("responses")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for response in responses {
                let Some(annotation) = response.get("fullTextAnnotation") else {
                    continue;
                };
                if let Some(text) = annotation.get("text").and_then(Value::as_str) {
                    pages.push(text.to_owned());
                }
                for page in annotation
                    .get("pages")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(confidence) =
                        page.get("confidence").and_then(Value::as_f64)
                    {
                        // Vision reports 0-1; the crate-wide contract is 0-100.
                        confidences.push(confidence * 100.0);
                    }
                }
            }
        }

        let average = if confidences.is_empty() {
            None
        } else {
            let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
            Some((mean * 100.0).round() / 100.0)
        };

        Ok(NormalizedDocument {
            provider: self.provider_name().to_owned(),
            job_id: Some(operation_name),
            job_status: "SUCCEEDED".to_owned(),
            input_location: Some(format!("gs://{}/{}", self.opts.bucket, key)),
            full_text: pages.join("\n"),
            blocks: vec![],
            key_value_pairs: vec![],
            key_values_best: Default::default(),
            tables: vec![],
            confidence: OcrConfidence {
                average,
                line_count: pages.len(),
            },
            meta: OcrMeta {
                warnings: vec![],
                document_metadata: Some(serde_json::json!({
                    "result_objects": result_keys.len(),
                })),
            },
        })
    }
}
