//! Domain records for insurance documents and their parsed contents.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::prelude::*;

/// Who uploaded a certificate.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploaderRole {
    Carrier,
    Agent,
    Customer,
}

impl UploaderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UploaderRole::Carrier => "CARRIER",
            UploaderRole::Agent => "AGENT",
            UploaderRole::Customer => "CUSTOMER",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "CARRIER" => Ok(UploaderRole::Carrier),
            "AGENT" => Ok(UploaderRole::Agent),
            "CUSTOMER" => Ok(UploaderRole::Customer),
            _ => Err(anyhow!("unknown uploader role: {s:?}")),
        }
    }
}

/// What kind of document was uploaded.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    /// A certificate of insurance.
    Coi,
    Other,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Coi => "COI",
            DocumentKind::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "COI" => Ok(DocumentKind::Coi),
            "OTHER" => Ok(DocumentKind::Other),
            _ => Err(anyhow!("unknown document kind: {s:?}")),
        }
    }
}

/// Where a document is in its OCR lifecycle.
///
/// Legal transitions are `None`/`Failed` → `Processing` → `Done` or `Failed`.
/// The claim step enforces at most one `Processing` run per document.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrStatus {
    None,
    Processing,
    Done,
    Failed,
}

impl OcrStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OcrStatus::None => "NONE",
            OcrStatus::Processing => "PROCESSING",
            OcrStatus::Done => "DONE",
            OcrStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(OcrStatus::None),
            "PROCESSING" => Ok(OcrStatus::Processing),
            "DONE" => Ok(OcrStatus::Done),
            "FAILED" => Ok(OcrStatus::Failed),
            _ => Err(anyhow!("unknown OCR status: {s:?}")),
        }
    }
}

/// Review status of the document as a whole.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    OnFile,
    NeedsReview,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::OnFile => "ON_FILE",
            DocumentStatus::NeedsReview => "NEEDS_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ON_FILE" => Ok(DocumentStatus::OnFile),
            "NEEDS_REVIEW" => Ok(DocumentStatus::NeedsReview),
            _ => Err(anyhow!("unknown document status: {s:?}")),
        }
    }
}

/// Categories of insurance coverage we recognize on a certificate.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageType {
    Auto,
    Cargo,
    Gl,
    Wc,
    Umbrella,
    Eo,
    Pollution,
    Cyber,
}

impl CoverageType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverageType::Auto => "AUTO",
            CoverageType::Cargo => "CARGO",
            CoverageType::Gl => "GL",
            CoverageType::Wc => "WC",
            CoverageType::Umbrella => "UMBRELLA",
            CoverageType::Eo => "EO",
            CoverageType::Pollution => "POLLUTION",
            CoverageType::Cyber => "CYBER",
        }
    }
}

/// One uploaded certificate file, as stored in `insurance_documents`.
#[derive(Clone, Debug)]
pub struct InsuranceDocument {
    pub id: i64,

    /// The FMCSA motor-carrier number this certificate documents.
    pub carrier_id: i64,

    pub uploader_role: UploaderRole,
    pub kind: DocumentKind,

    /// Object-storage key of the uploaded PDF.
    pub storage_key: String,

    pub ocr_status: OcrStatus,
    pub ocr_provider: Option<String>,
    pub ocr_job_id: Option<String>,

    /// Average OCR confidence, normalized to [0, 1].
    pub ocr_confidence: Option<f64>,

    pub extracted_text: Option<String>,
    pub parse_result: Option<ParseResult>,

    /// Parse confidence on the 0-100 scale.
    pub parse_confidence: Option<i32>,

    pub status: DocumentStatus,

    pub uploaded_at: DateTime<Utc>,
    pub ocr_started_at: Option<DateTime<Utc>>,
    pub ocr_completed_at: Option<DateTime<Utc>>,
    pub parsed_at: Option<DateTime<Utc>>,

    pub attempt_count: i32,
    pub last_error: Option<String>,
}

/// Structured output of the certificate parser, stored on the document row
/// and promoted into coverage snapshots.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseResult {
    /// Did the text look like an ACORD 25 certificate?
    pub acord_likely: bool,

    /// Additive confidence score, 0-100.
    pub confidence: u8,

    pub extracted: ExtractedCoverage,

    /// Which OCR provider produced the text, and what it reported about
    /// the job.
    pub ocr: OcrProvenance,
}

/// The coverage facts pulled out of the certificate text.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractedCoverage {
    /// Largest plausible automobile-liability limit, in whole dollars.
    pub auto_liability_limit: Option<i64>,

    /// Largest plausible motor-truck-cargo limit, in whole dollars.
    pub cargo_limit: Option<i64>,

    /// Largest plausible general-liability limit, in whole dollars.
    pub general_liability_limit: Option<i64>,

    /// Every `M/D/YYYY`-shaped token, deduplicated, in order of appearance.
    pub detected_dates: Vec<String>,

    pub detected_coverage_types: Vec<CoverageType>,
}

/// OCR provenance recorded alongside a parse result.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OcrProvenance {
    pub provider: String,
    pub meta: Value,
}

/// JSON response to a "parse document" trigger.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct ParseDocumentResponse {
    pub document_id: i64,
    pub carrier_id: i64,

    /// The OCR provider that produced (or originally produced) the result.
    pub provider: Option<String>,

    pub parse_result: ParseResult,

    /// Whether this run promoted a new coverage snapshot.
    pub promoted: bool,

    /// The snapshot version written by this run, if promotion happened.
    pub snapshot_version: Option<i64>,

    /// True when a stored result was returned without reprocessing.
    pub reused: bool,
}
