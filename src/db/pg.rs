//! Postgres-backed [`DocumentRepo`].
//!
//! The claim and the promotion are the two writes that must be atomic, so
//! each runs in its own explicit transaction. The `FOR UPDATE` row lock on
//! `insurance_documents` is the only concurrency-control primitive: at most
//! one OCR/parse run per document, with concurrent claims failing fast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    models::{
        DocumentKind, DocumentStatus, InsuranceDocument, OcrStatus, UploaderRole,
    },
    prelude::*,
};

use super::{ClaimOutcome, DocumentRepo, OcrResultUpdate, Promotion};

pub struct PgRepo {
    pool: PgPool,
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a freshly uploaded document and return its id.
    pub async fn insert_document(
        &self,
        carrier_id: i64,
        uploader_role: UploaderRole,
        kind: DocumentKind,
        storage_key: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO insurance_documents
                 (carrier_id, uploader_role, kind, storage_key, ocr_status, status)
             VALUES ($1, $2, $3, $4, 'NONE', 'ON_FILE')
             RETURNING id",
        )
        .bind(carrier_id)
        .bind(uploader_role.as_str())
        .bind(kind.as_str())
        .bind(storage_key)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert document")?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Fetch a document by id, without locking.
    pub async fn fetch_document(&self, document_id: i64) -> Result<Option<InsuranceDocument>> {
        let row = sqlx::query("SELECT * FROM insurance_documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch document")?;
        row.map(|row| document_from_row(&row)).transpose()
    }
}

#[async_trait]
impl DocumentRepo for PgRepo {
    #[instrument(level = "debug", skip_all, fields(%document_id))]
    async fn claim_document(&self, document_id: i64) -> Result<ClaimOutcome> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let row = sqlx::query("SELECT * FROM insurance_documents WHERE id = $1 FOR UPDATE")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to lock document row")?;
        let Some(row) = row else {
            return Ok(ClaimOutcome::NotFound);
        };
        let doc = document_from_row(&row)?;

        if doc.ocr_status == OcrStatus::Processing {
            // Dropping the transaction releases the lock.
            return Ok(ClaimOutcome::Busy);
        }
        if doc.ocr_status == OcrStatus::Done && doc.parse_result.is_some() {
            return Ok(ClaimOutcome::AlreadyDone(Box::new(doc)));
        }

        let row = sqlx::query(
            "UPDATE insurance_documents
             SET ocr_status = 'PROCESSING',
                 ocr_started_at = now(),
                 attempt_count = attempt_count + 1,
                 last_error = NULL
             WHERE id = $1
             RETURNING *",
        )
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to mark document processing")?;
        let doc = document_from_row(&row)?;
        tx.commit().await.context("failed to commit claim")?;
        Ok(ClaimOutcome::Claimed(doc))
    }

    #[instrument(level = "debug", skip_all, fields(%document_id))]
    async fn save_ocr_result(
        &self,
        document_id: i64,
        update: OcrResultUpdate,
    ) -> Result<()> {
        // `average_confidence` arrives on the provider's 0-100 scale; the
        // stored column is [0, 1].
        let normalized = update
            .average_confidence
            .map(|avg| (avg / 100.0).clamp(0.0, 1.0));
        let parse_result =
            serde_json::to_value(&update.parse_result).context("failed to serialize parse result")?;
        sqlx::query(
            "UPDATE insurance_documents
             SET ocr_status = 'DONE',
                 extracted_text = $2,
                 ocr_provider = $3,
                 ocr_job_id = $4,
                 ocr_confidence = $5,
                 ocr_completed_at = now(),
                 parse_result = $6,
                 parse_confidence = $7,
                 parsed_at = now(),
                 status = CASE WHEN $8 THEN 'NEEDS_REVIEW' ELSE status END
             WHERE id = $1",
        )
        .bind(document_id)
        .bind(&update.extracted_text)
        .bind(&update.provider)
        .bind(&update.job_id)
        .bind(normalized)
        .bind(parse_result)
        .bind(update.parse_confidence)
        .bind(update.needs_review)
        .execute(&self.pool)
        .await
        .context("failed to save OCR result")?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(%document_id))]
    async fn mark_failed(&self, document_id: i64, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE insurance_documents
             SET ocr_status = 'FAILED',
                 last_error = $2,
                 ocr_completed_at = now()
             WHERE id = $1",
        )
        .bind(document_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .context("failed to mark document failed")?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(%carrier_id))]
    async fn promote_snapshot(&self, carrier_id: i64, promotion: Promotion) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let row = sqlx::query(
            "INSERT INTO coverage_snapshots
                 (carrier_id, auto_liability_limit, cargo_limit,
                  general_liability_limit, source, vendor, last_checked_at,
                  snapshot_version, raw)
             VALUES ($1, $2, $3, $4, 'PARSED', $5, now(), 1, $6)
             ON CONFLICT (carrier_id) DO UPDATE SET
                 auto_liability_limit = EXCLUDED.auto_liability_limit,
                 cargo_limit = EXCLUDED.cargo_limit,
                 general_liability_limit = EXCLUDED.general_liability_limit,
                 source = EXCLUDED.source,
                 vendor = EXCLUDED.vendor,
                 last_checked_at = EXCLUDED.last_checked_at,
                 snapshot_version = coverage_snapshots.snapshot_version + 1,
                 raw = EXCLUDED.raw
             RETURNING snapshot_version",
        )
        .bind(carrier_id)
        .bind(promotion.auto_liability_limit)
        .bind(promotion.cargo_limit)
        .bind(promotion.general_liability_limit)
        .bind(&promotion.vendor)
        .bind(&promotion.raw)
        .fetch_one(&mut *tx)
        .await
        .context("failed to upsert coverage snapshot")?;
        let version = row.get::<i64, _>("snapshot_version");

        // Fully replace the itemized lines for this version; merging would
        // let a prior certificate's coverage types linger.
        sqlx::query(
            "DELETE FROM coverage_lines WHERE carrier_id = $1 AND snapshot_version = $2",
        )
        .bind(carrier_id)
        .bind(version)
        .execute(&mut *tx)
        .await
        .context("failed to clear coverage lines")?;

        for coverage in &promotion.coverage_types {
            sqlx::query(
                "INSERT INTO coverage_lines
                     (carrier_id, snapshot_version, coverage_type, limits)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(carrier_id)
            .bind(version)
            .bind(coverage.as_str())
            .bind(promotion.limits_payload(*coverage))
            .execute(&mut *tx)
            .await
            .context("failed to insert coverage line")?;
        }

        tx.commit().await.context("failed to commit promotion")?;
        info!(%carrier_id, version, "promoted coverage snapshot");
        Ok(version)
    }
}

/// Map a row from `insurance_documents`.
fn document_from_row(row: &PgRow) -> Result<InsuranceDocument> {
    let parse_result = row
        .try_get::<Option<Value>, _>("parse_result")?
        .map(serde_json::from_value)
        .transpose()
        .context("stored parse result is malformed")?;
    Ok(InsuranceDocument {
        id: row.try_get("id")?,
        carrier_id: row.try_get("carrier_id")?,
        uploader_role: UploaderRole::parse(row.try_get::<String, _>("uploader_role")?.as_str())?,
        kind: DocumentKind::parse(row.try_get::<String, _>("kind")?.as_str())?,
        storage_key: row.try_get("storage_key")?,
        ocr_status: OcrStatus::parse(row.try_get::<String, _>("ocr_status")?.as_str())?,
        ocr_provider: row.try_get("ocr_provider")?,
        ocr_job_id: row.try_get("ocr_job_id")?,
        ocr_confidence: row.try_get("ocr_confidence")?,
        extracted_text: row.try_get("extracted_text")?,
        parse_result,
        parse_confidence: row.try_get("parse_confidence")?,
        status: DocumentStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        uploaded_at: row.try_get::<DateTime<Utc>, _>("uploaded_at")?,
        ocr_started_at: row.try_get("ocr_started_at")?,
        ocr_completed_at: row.try_get("ocr_completed_at")?,
        parsed_at: row.try_get("parsed_at")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
    })
}

/// Create the pipeline's tables if they do not exist yet.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS insurance_documents (
             id BIGSERIAL PRIMARY KEY,
             carrier_id BIGINT NOT NULL,
             uploader_role TEXT NOT NULL,
             kind TEXT NOT NULL,
             storage_key TEXT NOT NULL,
             ocr_status TEXT NOT NULL DEFAULT 'NONE',
             ocr_provider TEXT,
             ocr_job_id TEXT,
             ocr_confidence DOUBLE PRECISION,
             extracted_text TEXT,
             parse_result JSONB,
             parse_confidence INTEGER,
             status TEXT NOT NULL DEFAULT 'ON_FILE',
             uploaded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             ocr_started_at TIMESTAMPTZ,
             ocr_completed_at TIMESTAMPTZ,
             parsed_at TIMESTAMPTZ,
             attempt_count INTEGER NOT NULL DEFAULT 0,
             last_error TEXT
         )",
    )
    .execute(pool)
    .await
    .context("failed to create insurance_documents")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS coverage_snapshots (
             carrier_id BIGINT PRIMARY KEY,
             auto_liability_limit BIGINT,
             cargo_limit BIGINT,
             general_liability_limit BIGINT,
             source TEXT NOT NULL,
             vendor TEXT NOT NULL,
             last_checked_at TIMESTAMPTZ NOT NULL,
             snapshot_version BIGINT NOT NULL,
             raw JSONB NOT NULL
         )",
    )
    .execute(pool)
    .await
    .context("failed to create coverage_snapshots")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS coverage_lines (
             id BIGSERIAL PRIMARY KEY,
             carrier_id BIGINT NOT NULL,
             snapshot_version BIGINT NOT NULL,
             coverage_type TEXT NOT NULL,
             limits JSONB NOT NULL DEFAULT '{}'::jsonb
         )",
    )
    .execute(pool)
    .await
    .context("failed to create coverage_lines")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS coverage_lines_carrier_version
         ON coverage_lines (carrier_id, snapshot_version)",
    )
    .execute(pool)
    .await
    .context("failed to create coverage_lines index")?;

    Ok(())
}
