//! OCR using AWS Textract's asynchronous document-analysis API.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use aws_sdk_textract::types::{
    BlockType, DocumentLocation, EntityType, FeatureType, RelationshipType, S3Object,
    SelectionStatus,
};
use leaky_bucket::RateLimiter;
use tokio::time;

use crate::{
    aws::load_aws_config,
    error::PipelineError,
    prelude::*,
    retry::{RetryOpts, with_retries},
    storage::ObjectStore,
};

use super::{
    DocumentOcrEngine, NormalizedDocument, OcrMeta, OcrOpts,
    block::{
        Block, BlockKind, BlockMap, KeyValueRole, Relationship, RelationshipKind,
        normalize_blocks,
    },
    object_key, poll_delay,
};

/// Cap on result-page fetches, to guard against a remote pagination bug that
/// never returns a final page.
const MAX_RESULT_PAGES: u32 = 1000;

/// Terminal state of an analysis job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Succeeded,
    PartialSuccess,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::PartialSuccess => "PARTIAL_SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }
}

/// One page of analysis results.
pub struct AnalysisPage {
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub blocks: Vec<Block>,
    pub next_token: Option<String>,
    pub warnings: Vec<String>,
    pub pages: Option<i32>,
}

/// The remote analysis-job boundary. Production wraps the Textract client;
/// tests script this with fakes.
#[async_trait]
pub trait AnalysisJobClient: Send + Sync + 'static {
    /// Start an analysis job for a stored document. Returns the job id, if
    /// the service provided one.
    async fn start_analysis(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<String>, PipelineError>;

    /// Fetch job status and one page of results.
    async fn get_analysis(
        &self,
        job_id: &str,
        next_token: Option<String>,
    ) -> Result<AnalysisPage, PipelineError>;
}

/// OCR engine wrapping the AWS Textract asynchronous analysis API.
pub struct TextractOcrEngine {
    client: Arc<dyn AnalysisJobClient>,
    store: Arc<dyn ObjectStore>,
    opts: OcrOpts,

    /// A rate limiter on job starts, to avoid hitting API limits.
    rate_limiter: RateLimiter,
}

impl TextractOcrEngine {
    /// Create an engine using ambient AWS credentials.
    pub async fn from_env(
        store: Arc<dyn ObjectStore>,
        opts: OcrOpts,
    ) -> Result<Arc<dyn DocumentOcrEngine>> {
        let config = load_aws_config().await?;
        let client = Arc::new(TextractAnalysisClient {
            client: aws_sdk_textract::Client::new(&config),
            retry: RetryOpts::default(),
        });
        Ok(Arc::new(Self::new(client, store, opts)))
    }

    pub fn new(
        client: Arc<dyn AnalysisJobClient>,
        store: Arc<dyn ObjectStore>,
        opts: OcrOpts,
    ) -> Self {
        let rate_limiter = RateLimiter::builder()
            .initial(opts.starts_per_second)
            .refill(opts.starts_per_second)
            .max(opts.starts_per_second)
            .interval(std::time::Duration::from_secs(1))
            .build();
        Self {
            client,
            store,
            opts,
            rate_limiter,
        }
    }

    /// Poll until the job reaches a terminal state, within the wait budget.
    async fn await_job(&self, job_id: &str) -> Result<AnalysisPage, PipelineError> {
        let started = Instant::now();
        let mut poll_idx = 0u32;
        let mut last_status = JobStatus::InProgress;
        loop {
            if started.elapsed() > self.opts.max_wait {
                return Err(PipelineError::Timeout {
                    elapsed_secs: started.elapsed().as_secs(),
                    last_status: last_status.as_str().to_owned(),
                });
            }
            let page = self.client.get_analysis(job_id, None).await?;
            match page.status {
                JobStatus::InProgress => {
                    last_status = page.status;
                    trace!(%job_id, poll_idx, "job still in progress");
                    time::sleep(poll_delay(poll_idx)).await;
                    poll_idx += 1;
                }
                JobStatus::Failed => {
                    return Err(PipelineError::RemoteFailure(format!(
                        "analysis job {job_id} failed: {}",
                        page.status_message.as_deref().unwrap_or("no status message")
                    )));
                }
                JobStatus::Succeeded | JobStatus::PartialSuccess => return Ok(page),
            }
        }
    }

    /// Follow the pagination cursor until the service stops returning one.
    async fn collect_pages(
        &self,
        job_id: &str,
        first: AnalysisPage,
    ) -> Result<AnalysisPage, PipelineError> {
        let mut combined = first;
        let mut fetched = 1u32;
        while let Some(token) = combined.next_token.take() {
            fetched += 1;
            if fetched > MAX_RESULT_PAGES {
                return Err(PipelineError::RemoteFailure(format!(
                    "analysis job {job_id} pagination exceeded {MAX_RESULT_PAGES} pages"
                )));
            }
            let page = self.client.get_analysis(job_id, Some(token)).await?;
            combined.blocks.extend(page.blocks);
            combined.warnings.extend(page.warnings);
            combined.next_token = page.next_token;
        }
        Ok(combined)
    }
}

#[async_trait]
impl DocumentOcrEngine for TextractOcrEngine {
    fn provider_name(&self) -> &'static str {
        "textract"
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

        // Upload the PDF. The store retries its own network calls.
        let key = object_key(&self.opts.key_prefix, key_hint);
        self.store
            .put(&self.opts.bucket, &key, pdf.to_vec(), "application/pdf")
            .await?;

        // Start the analysis job, rate limited.
        self.rate_limiter.acquire_one().await;
        let job_id = self
            .client
            .start_analysis(&self.opts.bucket, &key)
            .await?
            .ok_or_else(|| {
                PipelineError::RemoteFailure(
                    "analysis service returned no job id".to_owned(),
                )
            })?;
        info!(%job_id, %key, "started analysis job");

        // Wait for a terminal state, then drain all result pages.
        let first = self.await_job(&job_id).await?;
        let job_status = first.status;
        let combined = self.collect_pages(&job_id, first).await?;

        let warnings = combined.warnings.clone();
        let pages = combined.pages;
        let map = BlockMap::new(combined.blocks);
        let normalized = normalize_blocks(&map);
        debug!(
            lines = normalized.confidence.line_count,
            tables = normalized.tables.len(),
            pairs = normalized.key_value_pairs.len(),
            "normalized analysis blocks"
        );

        Ok(NormalizedDocument {
            provider: self.provider_name().to_owned(),
            job_id: Some(job_id),
            job_status: job_status.as_str().to_owned(),
            input_location: Some(format!("s3://{}/{}", self.opts.bucket, key)),
            full_text: normalized.full_text,
            blocks: map.iter().cloned().collect(),
            key_value_pairs: normalized.key_value_pairs,
            key_values_best: normalized.key_values_best,
            tables: normalized.tables,
            confidence: normalized.confidence,
            meta: OcrMeta {
                warnings,
                document_metadata: pages.map(|p| serde_json::json!({ "pages": p })),
            },
        })
    }
}

/// Production [`AnalysisJobClient`] over the Textract SDK. Every call is
/// wrapped in [`with_retries`].
pub struct TextractAnalysisClient {
    client: aws_sdk_textract::Client,
    retry: RetryOpts,
}

#[async_trait]
impl AnalysisJobClient for TextractAnalysisClient {
    async fn start_analysis(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<String>, PipelineError> {
        let location = DocumentLocation::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(key).build())
            .build();
        let output = with_retries(&self.retry, || async {
            self.client
                .start_document_analysis()
                .document_location(location.clone())
                .feature_types(FeatureType::Forms)
                .feature_types(FeatureType::Tables)
                .send()
                .await
        })
        .await
        .map_err(|err| {
            PipelineError::Other(
                anyhow::Error::new(err).context("failed to start document analysis"),
            )
        })?;
        Ok(output.job_id().map(str::to_owned))
    }

    async fn get_analysis(
        &self,
        job_id: &str,
        next_token: Option<String>,
    ) -> Result<AnalysisPage, PipelineError> {
        let output = with_retries(&self.retry, || {
            let next_token = next_token.clone();
            async {
                self.client
                    .get_document_analysis()
                    .job_id(job_id)
                    .set_next_token(next_token)
                    .send()
                    .await
            }
        })
        .await
        .map_err(|err| {
            PipelineError::Other(
                anyhow::Error::new(err).context("failed to get document analysis"),
            )
        })?;

        let status = match output.job_status() {
            Some(aws_sdk_textract::types::JobStatus::InProgress) | None => {
                JobStatus::InProgress
            }
            Some(aws_sdk_textract::types::JobStatus::Succeeded) => JobStatus::Succeeded,
            Some(aws_sdk_textract::types::JobStatus::PartialSuccess) => {
                JobStatus::PartialSuccess
            }
            Some(_) => JobStatus::Failed,
        };
        Ok(AnalysisPage {
            status,
            status_message: output.status_message().map(str::to_owned),
            blocks: output.blocks().iter().filter_map(from_sdk_block).collect(),
            next_token: output.next_token().map(str::to_owned),
            warnings: output
                .warnings()
                .iter()
                .map(|w| format!("{w:?}"))
                .collect(),
            pages: output.document_metadata().and_then(|m| m.pages()),
        })
    }
}

/// Convert an SDK block into our typed block. Blocks without ids cannot be
/// linked into the graph and are dropped.
fn from_sdk_block(block: &aws_sdk_textract::types::Block) -> Option<Block> {
    let id = block.id()?.to_owned();
    let kind = match block.block_type() {
        Some(BlockType::Page) => BlockKind::Page,
        Some(BlockType::Line) => BlockKind::Line,
        Some(BlockType::Word) => BlockKind::Word,
        Some(BlockType::KeyValueSet) => BlockKind::KeyValueSet,
        Some(BlockType::Table) => BlockKind::Table,
        Some(BlockType::Cell) => BlockKind::Cell,
        Some(BlockType::SelectionElement) => BlockKind::SelectionElement,
        _ => BlockKind::Other,
    };
    let key_value_role = if block.entity_types().contains(&EntityType::Key) {
        Some(KeyValueRole::Key)
    } else if block.entity_types().contains(&EntityType::Value) {
        Some(KeyValueRole::Value)
    } else {
        None
    };
    let relationships = block
        .relationships()
        .iter()
        .map(|rel| Relationship {
            kind: match rel.r#type() {
                Some(RelationshipType::Child) => RelationshipKind::Child,
                Some(RelationshipType::Value) => RelationshipKind::Value,
                _ => RelationshipKind::Other,
            },
            ids: rel.ids().to_vec(),
        })
        .collect();
    Some(Block {
        id,
        kind,
        text: block.text().map(str::to_owned),
        confidence: block.confidence().map(f64::from),
        key_value_role,
        selected: block
            .selection_status()
            .map(|s| *s == SelectionStatus::Selected),
        row_index: block.row_index().and_then(|i| u32::try_from(i).ok()),
        column_index: block.column_index().and_then(|i| u32::try_from(i).ok()),
        row_span: block.row_span().and_then(|i| u32::try_from(i).ok()),
        column_span: block.column_span().and_then(|i| u32::try_from(i).ok()),
        relationships,
    })
}
