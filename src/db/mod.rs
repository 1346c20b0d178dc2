//! Persistence boundary for documents and coverage snapshots.

use async_trait::async_trait;

use crate::{
    models::{CoverageType, InsuranceDocument, ParseResult},
    prelude::*,
};

pub mod pg;

/// Result of trying to claim a document for processing.
pub enum ClaimOutcome {
    /// The document was claimed and marked `PROCESSING`.
    Claimed(InsuranceDocument),

    /// The document is already `DONE` with a stored parse result; reuse it.
    AlreadyDone(Box<InsuranceDocument>),

    /// Another run currently holds the document.
    Busy,

    /// No such document.
    NotFound,
}

/// Everything persisted after a successful OCR + parse run.
pub struct OcrResultUpdate {
    pub extracted_text: String,
    pub provider: String,
    pub job_id: Option<String>,

    /// Average OCR confidence on the provider's 0-100 scale. Implementations
    /// normalize to [0, 1] with clamping before persisting; passing an
    /// already-normalized value here would silently corrupt the stored score.
    pub average_confidence: Option<f64>,

    pub parse_result: ParseResult,
    pub parse_confidence: i32,

    /// Downgrade the document to `NEEDS_REVIEW`.
    pub needs_review: bool,
}

/// Input to a snapshot promotion.
pub struct Promotion {
    pub auto_liability_limit: Option<i64>,
    pub cargo_limit: Option<i64>,
    pub general_liability_limit: Option<i64>,

    /// The OCR provider that produced the underlying parse.
    pub vendor: String,

    /// The full parse result, stored as the snapshot's raw payload.
    pub raw: Value,

    pub coverage_types: Vec<CoverageType>,
}

impl Promotion {
    /// The limits payload stored on a coverage line, keyed the way each
    /// coverage type names its headline limit.
    pub fn limits_payload(&self, coverage: CoverageType) -> Value {
        match coverage {
            CoverageType::Auto => match self.auto_liability_limit {
                Some(limit) => serde_json::json!({ "combined_single_limit": limit }),
                None => serde_json::json!({}),
            },
            CoverageType::Cargo => match self.cargo_limit {
                Some(limit) => serde_json::json!({ "cargo": limit }),
                None => serde_json::json!({}),
            },
            CoverageType::Gl => match self.general_liability_limit {
                Some(limit) => serde_json::json!({ "each_occurrence": limit }),
                None => serde_json::json!({}),
            },
            _ => serde_json::json!({}),
        }
    }
}

/// The repository operations the pipeline needs. The Postgres implementation
/// scopes each call in its own transaction; external I/O always happens
/// between calls, never inside one.
#[async_trait]
pub trait DocumentRepo: Send + Sync + 'static {
    /// Step 0: row-lock the document and claim it for processing.
    async fn claim_document(&self, document_id: i64) -> Result<ClaimOutcome>;

    /// Step 4: persist OCR output and parse result, marking the document
    /// `DONE`.
    async fn save_ocr_result(&self, document_id: i64, update: OcrResultUpdate)
    -> Result<()>;

    /// Failure path: mark the document `FAILED` with a diagnosable message.
    async fn mark_failed(&self, document_id: i64, message: &str) -> Result<()>;

    /// Step 5: upsert the carrier's coverage snapshot and fully replace its
    /// itemized lines. Returns the new snapshot version.
    async fn promote_snapshot(&self, carrier_id: i64, promotion: Promotion)
    -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promotion() -> Promotion {
        Promotion {
            auto_liability_limit: Some(1_000_000),
            cargo_limit: Some(100_000),
            general_liability_limit: None,
            vendor: "textract".to_owned(),
            raw: serde_json::json!({}),
            coverage_types: vec![CoverageType::Auto, CoverageType::Cargo, CoverageType::Wc],
        }
    }

    #[test]
    fn limits_are_wrapped_in_type_specific_keys() {
        let promotion = promotion();
        assert_eq!(
            promotion.limits_payload(CoverageType::Auto),
            serde_json::json!({ "combined_single_limit": 1_000_000 })
        );
        assert_eq!(
            promotion.limits_payload(CoverageType::Cargo),
            serde_json::json!({ "cargo": 100_000 })
        );
        // GL was detected without a limit: empty payload, not an error.
        assert_eq!(
            promotion.limits_payload(CoverageType::Gl),
            serde_json::json!({})
        );
        // Types with no headline limit key get an empty payload.
        assert_eq!(
            promotion.limits_payload(CoverageType::Wc),
            serde_json::json!({})
        );
    }
}
