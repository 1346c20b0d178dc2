//! The document lifecycle orchestrator.
//!
//! Ties claim, fetch, OCR, parse, persistence, and promotion together for
//! one document at a time. The claim's row lock gives at-most-one concurrent
//! run per document; everything network-bound happens between transactions
//! so no lock is held during slow remote I/O.

use std::sync::Arc;

use crate::{
    acord::{PROMOTION_THRESHOLD, parse_certificate},
    db::{ClaimOutcome, DocumentRepo, OcrResultUpdate, Promotion},
    error::PipelineError,
    models::{InsuranceDocument, OcrProvenance, ParseDocumentResponse},
    ocr::{DocumentOcrEngine, NormalizedDocument},
    prelude::*,
    storage::ObjectStore,
};

pub struct DocumentPipeline {
    repo: Arc<dyn DocumentRepo>,
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn DocumentOcrEngine>,

    /// Bucket holding uploaded documents.
    bucket: String,
}

impl DocumentPipeline {
    pub fn new(
        repo: Arc<dyn DocumentRepo>,
        store: Arc<dyn ObjectStore>,
        engine: Arc<dyn DocumentOcrEngine>,
        bucket: String,
    ) -> Self {
        Self {
            repo,
            store,
            engine,
            bucket,
        }
    }

    /// Handle a "parse this document" trigger.
    #[instrument(level = "debug", skip_all, fields(%document_id))]
    pub async fn parse_document(
        &self,
        document_id: i64,
    ) -> Result<ParseDocumentResponse, PipelineError> {
        // Step 0: claim the document under a row lock.
        let doc = match self.repo.claim_document(document_id).await? {
            ClaimOutcome::NotFound => {
                return Err(PipelineError::Validation(format!(
                    "document {document_id} not found"
                )));
            }
            ClaimOutcome::Busy => return Err(PipelineError::Conflict(document_id)),
            ClaimOutcome::AlreadyDone(doc) => {
                info!("reusing stored parse result");
                let parse_result = doc.parse_result.clone().ok_or_else(|| {
                    anyhow!("document {document_id} is DONE without a parse result")
                })?;
                return Ok(ParseDocumentResponse {
                    document_id: doc.id,
                    carrier_id: doc.carrier_id,
                    provider: doc.ocr_provider.clone(),
                    parse_result,
                    promoted: false,
                    snapshot_version: None,
                    reused: true,
                });
            }
            ClaimOutcome::Claimed(doc) => doc,
        };

        // Steps 1-5, with the failure path writing the error back onto the
        // document. The claim transaction has already committed, so this
        // write is best-effort by design.
        match self.process_claimed(&doc).await {
            Ok(response) => Ok(response),
            Err(err) => {
                let message = err.to_string();
                error!(%message, kind = err.kind(), "parse run failed");
                if let Err(mark_err) = self.repo.mark_failed(doc.id, &message).await {
                    error!(%mark_err, "could not record failure on document");
                }
                Err(err)
            }
        }
    }

    async fn process_claimed(
        &self,
        doc: &InsuranceDocument,
    ) -> Result<ParseDocumentResponse, PipelineError> {
        // Step 1: fetch the stored PDF.
        let pdf = self.store.get(&self.bucket, &doc.storage_key).await?;

        // Step 2: OCR. A provider that "succeeds" without text is a failure.
        let key_hint = format!("carrier-{}-doc-{}", doc.carrier_id, doc.id);
        let normalized = self.engine.normalize_document(&pdf, &key_hint).await?;
        if normalized.full_text.trim().is_empty() {
            return Err(PipelineError::RemoteFailure(
                "OCR produced no usable text".to_owned(),
            ));
        }

        // Step 3: parse.
        let parsed = parse_certificate(&normalized.full_text, provenance(&normalized));
        let needs_review = parsed.confidence < PROMOTION_THRESHOLD;

        // Step 4: persist OCR output and the parse result.
        self.repo
            .save_ocr_result(
                doc.id,
                OcrResultUpdate {
                    extracted_text: normalized.full_text.clone(),
                    provider: normalized.provider.clone(),
                    job_id: normalized.job_id.clone(),
                    average_confidence: normalized.confidence.average,
                    parse_result: parsed.clone(),
                    parse_confidence: i32::from(parsed.confidence),
                    needs_review,
                },
            )
            .await?;

        // Step 5: promote only confident parses into a snapshot.
        let snapshot_version = if needs_review {
            debug!(
                confidence = parsed.confidence,
                "below promotion threshold, leaving snapshot untouched"
            );
            None
        } else {
            let version = self
                .repo
                .promote_snapshot(
                    doc.carrier_id,
                    Promotion {
                        auto_liability_limit: parsed.extracted.auto_liability_limit,
                        cargo_limit: parsed.extracted.cargo_limit,
                        general_liability_limit: parsed.extracted.general_liability_limit,
                        vendor: normalized.provider.clone(),
                        raw: serde_json::to_value(&parsed)
                            .context("failed to serialize parse result")?,
                        coverage_types: parsed.extracted.detected_coverage_types.clone(),
                    },
                )
                .await?;
            Some(version)
        };

        Ok(ParseDocumentResponse {
            document_id: doc.id,
            carrier_id: doc.carrier_id,
            provider: Some(normalized.provider),
            parse_result: parsed,
            promoted: snapshot_version.is_some(),
            snapshot_version,
            reused: false,
        })
    }
}

/// OCR provenance recorded on the parse result.
fn provenance(normalized: &NormalizedDocument) -> OcrProvenance {
    OcrProvenance {
        provider: normalized.provider.clone(),
        meta: serde_json::json!({
            "job_id": normalized.job_id,
            "job_status": normalized.job_status,
            "input_location": normalized.input_location,
            "warnings": normalized.meta.warnings,
            "document_metadata": normalized.meta.document_metadata,
            "line_count": normalized.confidence.line_count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::{
        models::{DocumentKind, DocumentStatus, OcrStatus, UploaderRole},
        ocr::{OcrMeta, block::OcrConfidence},
    };

    fn base_document(id: i64) -> InsuranceDocument {
        InsuranceDocument {
            id,
            carrier_id: 42,
            uploader_role: UploaderRole::Agent,
            kind: DocumentKind::Coi,
            storage_key: format!("uploads/doc-{id}.pdf"),
            ocr_status: OcrStatus::None,
            ocr_provider: None,
            ocr_job_id: None,
            ocr_confidence: None,
            extracted_text: None,
            parse_result: None,
            parse_confidence: None,
            status: DocumentStatus::OnFile,
            uploaded_at: Utc::now(),
            ocr_started_at: None,
            ocr_completed_at: None,
            parsed_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// In-memory repo that mimics the Postgres claim/promotion semantics.
    #[derive(Default)]
    struct MemoryRepo {
        documents: Mutex<Vec<InsuranceDocument>>,
        snapshot_versions: Mutex<Vec<(i64, i64)>>,
        promoted: Mutex<Vec<Promotion>>,
    }

    impl MemoryRepo {
        fn with_document(doc: InsuranceDocument) -> Self {
            let repo = Self::default();
            repo.documents.lock().unwrap().push(doc);
            repo
        }

        fn document(&self, id: i64) -> InsuranceDocument {
            self.documents
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .expect("document exists")
        }
    }

    #[async_trait]
    impl DocumentRepo for MemoryRepo {
        async fn claim_document(&self, document_id: i64) -> Result<ClaimOutcome> {
            let mut docs = self.documents.lock().unwrap();
            let Some(doc) = docs.iter_mut().find(|d| d.id == document_id) else {
                return Ok(ClaimOutcome::NotFound);
            };
            if doc.ocr_status == OcrStatus::Processing {
                return Ok(ClaimOutcome::Busy);
            }
            if doc.ocr_status == OcrStatus::Done && doc.parse_result.is_some() {
                return Ok(ClaimOutcome::AlreadyDone(Box::new(doc.clone())));
            }
            doc.ocr_status = OcrStatus::Processing;
            doc.attempt_count += 1;
            doc.last_error = None;
            Ok(ClaimOutcome::Claimed(doc.clone()))
        }

        async fn save_ocr_result(
            &self,
            document_id: i64,
            update: OcrResultUpdate,
        ) -> Result<()> {
            let mut docs = self.documents.lock().unwrap();
            let doc = docs
                .iter_mut()
                .find(|d| d.id == document_id)
                .ok_or_else(|| anyhow!("no document {document_id}"))?;
            doc.ocr_status = OcrStatus::Done;
            doc.extracted_text = Some(update.extracted_text);
            doc.ocr_provider = Some(update.provider);
            doc.ocr_job_id = update.job_id;
            doc.ocr_confidence = update
                .average_confidence
                .map(|avg| (avg / 100.0).clamp(0.0, 1.0));
            doc.parse_result = Some(update.parse_result);
            doc.parse_confidence = Some(update.parse_confidence);
            if update.needs_review {
                doc.status = DocumentStatus::NeedsReview;
            }
            Ok(())
        }

        async fn mark_failed(&self, document_id: i64, message: &str) -> Result<()> {
            let mut docs = self.documents.lock().unwrap();
            let doc = docs
                .iter_mut()
                .find(|d| d.id == document_id)
                .ok_or_else(|| anyhow!("no document {document_id}"))?;
            doc.ocr_status = OcrStatus::Failed;
            doc.last_error = Some(message.to_owned());
            Ok(())
        }

        async fn promote_snapshot(
            &self,
            carrier_id: i64,
            promotion: Promotion,
        ) -> Result<i64> {
            let mut versions = self.snapshot_versions.lock().unwrap();
            let version = match versions.iter_mut().find(|(c, _)| *c == carrier_id) {
                Some((_, version)) => {
                    *version += 1;
                    *version
                }
                None => {
                    versions.push((carrier_id, 1));
                    1
                }
            };
            self.promoted.lock().unwrap().push(promotion);
            Ok(version)
        }
    }

    struct MemoryStore(Mutex<Vec<(String, Vec<u8>)>>);

    impl MemoryStore {
        fn with_object(key: &str, bytes: &[u8]) -> Self {
            Self(Mutex::new(vec![(key.to_owned(), bytes.to_vec())]))
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(
            &self,
            _bucket: &str,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<()> {
            self.0.lock().unwrap().push((key.to_owned(), bytes));
            Ok(())
        }

        async fn get(&self, _bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| anyhow!("no such key: {key}"))
        }

        async fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    /// Engine that returns fixed text and counts invocations.
    struct FixedTextEngine {
        text: String,
        calls: AtomicU32,
    }

    impl FixedTextEngine {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_owned(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentOcrEngine for FixedTextEngine {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        async fn normalize_document(
            &self,
            _pdf: &[u8],
            _key_hint: &str,
        ) -> Result<NormalizedDocument, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(NormalizedDocument {
                provider: "fake".to_owned(),
                job_id: Some("job-1".to_owned()),
                job_status: "SUCCEEDED".to_owned(),
                input_location: None,
                full_text: self.text.clone(),
                blocks: vec![],
                key_value_pairs: vec![],
                key_values_best: Default::default(),
                tables: vec![],
                confidence: OcrConfidence {
                    average: Some(95.0),
                    line_count: 10,
                },
                meta: OcrMeta::default(),
            })
        }
    }

    /// Certificate text that scores 85: ACORD + auto limit + GL limit + dates.
    const CONFIDENT_TEXT: &str = "\
ACORD
CERTIFICATE OF LIABILITY INSURANCE
THIS CERTIFICATE IS ISSUED AS A MATTER OF INFORMATION ONLY
PRODUCER
INSURED
COVERAGES 01/01/2024 06/30/2025
COMMERCIAL GENERAL LIABILITY EACH OCCURRENCE $1,000,000
AUTOMOBILE LIABILITY COMBINED SINGLE LIMIT $1,000,000";

    /// Text that scores 40: ACORD-likely, no limits, one date.
    const VAGUE_TEXT: &str = "\
ACORD
CERTIFICATE OF LIABILITY INSURANCE
PRODUCER
INSURED
COVERAGES 01/01/2024
SEE ATTACHED SCHEDULE FOR LIMITS";

    fn pipeline_for(
        repo: Arc<MemoryRepo>,
        engine: Arc<FixedTextEngine>,
        storage_key: &str,
    ) -> DocumentPipeline {
        DocumentPipeline::new(
            repo,
            Arc::new(MemoryStore::with_object(storage_key, b"%PDF-1.4")),
            engine,
            "coi-documents".to_owned(),
        )
    }

    #[tokio::test]
    async fn confident_parse_promotes_a_snapshot() {
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let pipeline = pipeline_for(repo.clone(), engine, "uploads/doc-1.pdf");

        let response = pipeline.parse_document(1).await.unwrap();
        assert!(response.promoted);
        assert_eq!(response.snapshot_version, Some(1));
        assert!(!response.reused);
        assert_eq!(response.parse_result.confidence, 85);

        let doc = repo.document(1);
        assert_eq!(doc.ocr_status, OcrStatus::Done);
        assert_eq!(doc.status, DocumentStatus::OnFile);
        assert_eq!(doc.attempt_count, 1);
        // Provider reported 95.0 on the 0-100 scale; stored as 0.95.
        assert_eq!(doc.ocr_confidence, Some(0.95));
    }

    #[tokio::test]
    async fn low_confidence_downgrades_without_promotion() {
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let engine = Arc::new(FixedTextEngine::new(VAGUE_TEXT));
        let pipeline = pipeline_for(repo.clone(), engine, "uploads/doc-1.pdf");

        let response = pipeline.parse_document(1).await.unwrap();
        assert!(!response.promoted);
        assert_eq!(response.snapshot_version, None);
        assert!(response.parse_result.confidence < 70);

        let doc = repo.document(1);
        assert_eq!(doc.status, DocumentStatus::NeedsReview);
        assert!(repo.promoted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_reuses_the_stored_result_without_new_work() {
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let pipeline = pipeline_for(repo.clone(), engine.clone(), "uploads/doc-1.pdf");

        let first = pipeline.parse_document(1).await.unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            let replay = pipeline.parse_document(1).await.unwrap();
            assert!(replay.reused);
            assert!(!replay.promoted);
            assert_eq!(replay.parse_result, first.parse_result);
        }
        // No additional OCR work happened.
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_claim_conflicts_fail_fast() {
        let mut doc = base_document(1);
        doc.ocr_status = OcrStatus::Processing;
        let repo = Arc::new(MemoryRepo::with_document(doc));
        let engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let pipeline = pipeline_for(repo, engine.clone(), "uploads/doc-1.pdf");

        let err = pipeline.parse_document(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(1)));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_documents_are_a_validation_error() {
        let repo = Arc::new(MemoryRepo::default());
        let engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let pipeline = pipeline_for(repo, engine, "uploads/doc-1.pdf");

        let err = pipeline.parse_document(99).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_ocr_text_fails_and_marks_the_document() {
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let engine = Arc::new(FixedTextEngine::new("   "));
        let pipeline = pipeline_for(repo.clone(), engine, "uploads/doc-1.pdf");

        let err = pipeline.parse_document(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::RemoteFailure(_)));

        let doc = repo.document(1);
        assert_eq!(doc.ocr_status, OcrStatus::Failed);
        assert!(doc.last_error.as_deref().unwrap().contains("no usable text"));
    }

    #[tokio::test]
    async fn failed_documents_can_be_retried_fresh() {
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let empty_engine = Arc::new(FixedTextEngine::new(""));
        let pipeline = pipeline_for(repo.clone(), empty_engine, "uploads/doc-1.pdf");
        pipeline.parse_document(1).await.unwrap_err();
        assert_eq!(repo.document(1).ocr_status, OcrStatus::Failed);

        // A later explicit retry re-enters the claim step fresh.
        let good_engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let pipeline = pipeline_for(repo.clone(), good_engine, "uploads/doc-1.pdf");
        let response = pipeline.parse_document(1).await.unwrap();
        assert!(response.promoted);
        assert_eq!(repo.document(1).attempt_count, 2);
        assert_eq!(repo.document(1).last_error, None);
    }

    #[tokio::test]
    async fn promotion_threshold_is_inclusive_at_70() {
        // Auto limit (25) + cargo limit (25) + GL limit (10) + two dates
        // (10) with no ACORD signals scores exactly 70, the lowest score
        // that still promotes.
        let threshold_text = "\
AUTOMOBILE LIABILITY COMBINED SINGLE LIMIT $1,000,000
MOTOR TRUCK CARGO TRUCK $100,000
COMMERCIAL GENERAL LIABILITY EACH OCCURRENCE $2,000,000
01/01/2024 06/30/2025";
        let repo = Arc::new(MemoryRepo::with_document(base_document(1)));
        let engine = Arc::new(FixedTextEngine::new(threshold_text));
        let pipeline = pipeline_for(repo.clone(), engine, "uploads/doc-1.pdf");

        let response = pipeline.parse_document(1).await.unwrap();
        assert_eq!(response.parse_result.confidence, PROMOTION_THRESHOLD);
        assert!(response.promoted);
        assert_eq!(repo.document(1).status, DocumentStatus::OnFile);
    }

    #[tokio::test]
    async fn snapshot_versions_increment_per_promotion() {
        let repo = Arc::new(MemoryRepo::default());
        repo.documents.lock().unwrap().push(base_document(1));
        repo.documents.lock().unwrap().push({
            let mut doc = base_document(2);
            doc.storage_key = "uploads/doc-2.pdf".to_owned();
            doc
        });
        let engine = Arc::new(FixedTextEngine::new(CONFIDENT_TEXT));
        let store = MemoryStore(Mutex::new(vec![
            ("uploads/doc-1.pdf".to_owned(), b"%PDF-1.4".to_vec()),
            ("uploads/doc-2.pdf".to_owned(), b"%PDF-1.4".to_vec()),
        ]));
        let pipeline = DocumentPipeline::new(
            repo.clone(),
            Arc::new(store),
            engine,
            "coi-documents".to_owned(),
        );

        // Both documents belong to carrier 42: versions 1 then 2.
        let first = pipeline.parse_document(1).await.unwrap();
        let second = pipeline.parse_document(2).await.unwrap();
        assert_eq!(first.snapshot_version, Some(1));
        assert_eq!(second.snapshot_version, Some(2));
    }
}
