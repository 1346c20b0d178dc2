use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::prelude::*;

mod acord;
mod aws;
mod cmd;
mod db;
mod error;
mod models;
mod ocr;
mod pipeline;
mod prelude;
mod retry;
mod storage;

/// Turn certificates of insurance into structured coverage data.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - DATABASE_URL: PostgreSQL connection string.
  - COI_OCR_PROVIDER (optional): "textract" (default) or "vision".
  - COI_DOCUMENT_BUCKET (optional): bucket holding uploaded documents.
  - COI_STORAGE_ENDPOINT (optional): S3-compatible endpoint override,
    for DigitalOcean Spaces or minio.
  - GOOGLE_VISION_API_KEY: required by the "vision" provider.

  Standard AWS environment variables and credential files are used
  for Textract and S3.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR and parse an uploaded certificate, promoting confident results
    /// into the carrier's coverage snapshot.
    Parse(cmd::parse::ParseOpts),
    /// Run the certificate parser over a local text file.
    ParseText(cmd::parse_text::ParseTextOpts),
    /// Create the pipeline's database tables.
    Migrate(cmd::migrate::MigrateOpts),
    /// Print schemas for output formats.
    Schema(cmd::schema::SchemaOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Parse(opts) => {
            cmd::parse::cmd_parse(opts).await?;
        }
        Cmd::ParseText(opts) => {
            cmd::parse_text::cmd_parse_text(opts).await?;
        }
        Cmd::Migrate(opts) => {
            cmd::migrate::cmd_migrate(opts).await?;
        }
        Cmd::Schema(opts) => {
            cmd::schema::cmd_schema(opts).await?;
        }
    }
    Ok(())
}
