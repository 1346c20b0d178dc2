//! The `parse` subcommand: run the full OCR/parse pipeline for a document.

use std::{env, sync::Arc, time::Duration};

use clap::Args;

use crate::{
    aws::s3_client,
    db::pg::PgRepo,
    ocr::{OcrOpts, OcrProvider, ocr_engine_for_provider},
    pipeline::DocumentPipeline,
    prelude::*,
    storage::S3Store,
};

use super::connect_pool;

/// Parse command line arguments.
#[derive(Debug, Args)]
pub struct ParseOpts {
    /// The document to parse.
    #[clap(long)]
    pub document_id: i64,

    /// The OCR provider to use. Defaults to `COI_OCR_PROVIDER`, then
    /// textract.
    #[clap(long, value_enum)]
    pub provider: Option<OcrProvider>,

    /// Bucket holding uploaded documents. Defaults to `COI_DOCUMENT_BUCKET`.
    #[clap(long)]
    pub bucket: Option<String>,

    /// Maximum seconds to wait for the OCR job.
    #[clap(long, default_value = "150")]
    pub max_wait: u64,
}

/// The `parse` subcommand.
#[instrument(level = "debug", skip_all, fields(document_id = %opts.document_id))]
pub async fn cmd_parse(opts: &ParseOpts) -> Result<()> {
    let pool = connect_pool().await?;
    let provider = match opts.provider {
        Some(provider) => provider,
        None => provider_from_env()?,
    };
    let default_opts = OcrOpts::default();
    let bucket = opts
        .bucket
        .clone()
        .or_else(|| env::var("COI_DOCUMENT_BUCKET").ok())
        .unwrap_or(default_opts.bucket);

    // Clients are constructed here and injected; nothing below this layer
    // reaches for global state.
    let store = Arc::new(S3Store::new(s3_client().await?));
    let ocr_opts = OcrOpts {
        bucket: bucket.clone(),
        max_wait: Duration::from_secs(opts.max_wait),
        ..OcrOpts::default()
    };
    let engine = ocr_engine_for_provider(provider, store.clone(), ocr_opts).await?;
    let pipeline =
        DocumentPipeline::new(Arc::new(PgRepo::new(pool)), store, engine, bucket);

    let response = pipeline.parse_document(opts.document_id).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Read the deployment's provider selection from `COI_OCR_PROVIDER`.
fn provider_from_env() -> Result<OcrProvider> {
    match std::env::var("COI_OCR_PROVIDER").ok().as_deref() {
        None | Some("textract") => Ok(OcrProvider::Textract),
        Some("vision") => Ok(OcrProvider::Vision),
        Some(other) => Err(anyhow!("unknown OCR provider: {other:?}")),
    }
}
