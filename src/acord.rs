//! Heuristic parser for ACORD 25 certificate-of-liability text.
//!
//! OCR text is noisy, so nothing in here returns an error: unexpected input
//! degrades to a low confidence score instead.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{CoverageType, ExtractedCoverage, OcrProvenance, ParseResult};

/// Phrases that mark a document as an ACORD 25 certificate.
const ACORD_SIGNALS: [&str; 6] = [
    "CERTIFICATE OF LIABILITY INSURANCE",
    "ACORD",
    "PRODUCER",
    "INSURED",
    "COVERAGES",
    "THIS CERTIFICATE IS ISSUED AS A MATTER OF INFORMATION ONLY",
];

/// How many signals must appear before we call the document ACORD-likely.
const MIN_ACORD_SIGNALS: usize = 3;

/// Section headings that end the coverages block.
const COVERAGE_TRAILERS: [&str; 4] = [
    "DESCRIPTION OF OPERATIONS",
    "CERTIFICATE HOLDER",
    "CANCELLATION",
    "SHOULD ANY OF THE ABOVE DESCRIBED POLICIES BE CANCELLED",
];

/// A trailer must appear at least this far past "COVERAGES" to count; the
/// ACORD form repeats section names in its table-of-contents line.
const TRAILER_MIN_OFFSET: usize = 40;

/// Window sizes for limit extraction around a coverage keyword. Tuned
/// against real ACORD layouts; widen with care, since a too-large window
/// starts picking up the next coverage row's limits.
const LIMIT_WINDOW_BEFORE: usize = 100;
const LIMIT_WINDOW_AFTER: usize = 1000;
const LIMIT_WINDOW_AFTER_CARGO: usize = 1200;

/// Parse confidence at or above which the orchestrator promotes a snapshot.
pub const PROMOTION_THRESHOLD: u8 = 70;

/// `M/D/YYYY`-shaped tokens, tolerating 2-digit years.
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b").expect("date pattern is valid")
});

/// Dollar-formatted amounts: optional `$`, comma-grouped thousands, optional
/// cents; or a `$`-prefixed plain number.
static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$?\s*\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\$\s*\d+(?:\.\d{2})?")
        .expect("money pattern is valid")
});

/// Keyword vocabularies for detecting coverage types in certificate text.
fn coverage_keywords(coverage: CoverageType) -> &'static [&'static str] {
    match coverage {
        CoverageType::Gl => &["COMMERCIAL GENERAL LIABILITY", "GENERAL LIABILITY"],
        CoverageType::Auto => &["AUTOMOBILE LIABILITY", "AUTO LIABILITY", "ANY AUTO"],
        CoverageType::Cargo => &["MOTOR TRUCK CARGO", "CARGO"],
        CoverageType::Wc => &["WORKERS COMPENSATION", "WORKERS' COMPENSATION"],
        CoverageType::Umbrella => &["UMBRELLA LIAB", "EXCESS LIAB"],
        CoverageType::Eo => &[
            "PROFESSIONAL LIABILITY",
            "ERRORS AND OMISSIONS",
            "ERRORS & OMISSIONS",
        ],
        CoverageType::Pollution => &["POLLUTION"],
        CoverageType::Cyber => &["CYBER"],
    }
}

/// Parse extracted certificate text into structured coverage facts.
pub fn parse_certificate(text: &str, ocr: OcrProvenance) -> ParseResult {
    let upper = text.to_uppercase();

    let signal_count = ACORD_SIGNALS
        .iter()
        .filter(|signal| upper.contains(*signal))
        .count();
    let acord_likely = signal_count >= MIN_ACORD_SIGNALS;

    let detected_dates = extract_dates(text);
    let coverage_block = coverage_block(&upper);
    let detected_coverage_types = detect_coverage_types(&upper);

    let auto_liability_limit = detected_coverage_types
        .contains(&CoverageType::Auto)
        .then(|| limit_near_keywords(coverage_block, CoverageType::Auto))
        .flatten();
    let cargo_limit = detected_coverage_types
        .contains(&CoverageType::Cargo)
        .then(|| limit_near_keywords(coverage_block, CoverageType::Cargo))
        .flatten();
    let general_liability_limit = detected_coverage_types
        .contains(&CoverageType::Gl)
        .then(|| limit_near_keywords(coverage_block, CoverageType::Gl))
        .flatten();

    let mut confidence = 0u32;
    if acord_likely {
        confidence += 40;
    }
    if auto_liability_limit.is_some() {
        confidence += 25;
    }
    if cargo_limit.is_some() {
        confidence += 25;
    }
    if general_liability_limit.is_some() {
        confidence += 10;
    }
    if detected_dates.len() >= 2 {
        confidence += 10;
    }

    ParseResult {
        acord_likely,
        confidence: confidence.min(100) as u8,
        extracted: ExtractedCoverage {
            auto_liability_limit,
            cargo_limit,
            general_liability_limit,
            detected_dates,
            detected_coverage_types,
        },
        ocr,
    }
}

/// All date-shaped tokens, deduplicated, in order of appearance.
fn extract_dates(text: &str) -> Vec<String> {
    let mut dates = vec![];
    for found in DATE_RE.find_iter(text) {
        let date = found.as_str().to_owned();
        if !dates.contains(&date) {
            dates.push(date);
        }
    }
    dates
}

/// Slice out the coverages section: from "COVERAGES" to the earliest
/// trailing-section heading past a small offset. Absent a heading, the whole
/// text is the block.
fn coverage_block(upper: &str) -> &str {
    let Some(start) = upper.find("COVERAGES") else {
        return upper;
    };
    let block = &upper[start..];
    let search_from = TRAILER_MIN_OFFSET.min(block.len());
    let end = COVERAGE_TRAILERS
        .iter()
        .filter_map(|trailer| {
            block
                .get(search_from..)
                .and_then(|rest| rest.find(trailer))
                .map(|idx| search_from + idx)
        })
        .min();
    match end {
        Some(end) => &block[..end],
        None => block,
    }
}

/// Which coverage types does the text mention?
fn detect_coverage_types(upper: &str) -> Vec<CoverageType> {
    let mut detected = vec![];
    for coverage in [
        CoverageType::Gl,
        CoverageType::Auto,
        CoverageType::Cargo,
        CoverageType::Wc,
        CoverageType::Umbrella,
        CoverageType::Eo,
        CoverageType::Pollution,
        CoverageType::Cyber,
    ] {
        let present = match coverage {
            // "CARGO" alone matches freight boilerplate; require the truck
            // context unless the full form name appears.
            CoverageType::Cargo => {
                upper.contains("MOTOR TRUCK CARGO")
                    || (upper.contains("CARGO") && upper.contains("TRUCK"))
            }
            _ => coverage_keywords(coverage)
                .iter()
                .any(|keyword| upper.contains(keyword)),
        };
        if present && !detected.contains(&coverage) {
            detected.push(coverage);
        }
    }
    detected
}

/// The largest dollar amount near any of a coverage type's keywords.
fn limit_near_keywords(block: &str, coverage: CoverageType) -> Option<i64> {
    let window_after = match coverage {
        CoverageType::Cargo => LIMIT_WINDOW_AFTER_CARGO,
        _ => LIMIT_WINDOW_AFTER,
    };
    let mut best: Option<i64> = None;
    for keyword in coverage_keywords(coverage) {
        let Some(idx) = block.find(keyword) else {
            continue;
        };
        let start = floor_char_boundary(block, idx.saturating_sub(LIMIT_WINDOW_BEFORE));
        let end =
            ceil_char_boundary(block, (idx + keyword.len() + window_after).min(block.len()));
        let window = &block[start..end];
        if let Some(limit) = max_dollar_amount(window) {
            best = Some(best.map_or(limit, |prev| prev.max(limit)));
        }
    }
    best
}

/// The numeric maximum of every dollar-formatted amount in the window.
fn max_dollar_amount(window: &str) -> Option<i64> {
    MONEY_RE
        .find_iter(window)
        .filter_map(|found| {
            let cleaned: String = found
                .as_str()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            cleaned.parse::<f64>().ok().map(|amount| amount as i64)
        })
        .max()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
