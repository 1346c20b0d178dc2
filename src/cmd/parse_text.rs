//! The `parse-text` subcommand: run the certificate parser over a local
//! text file. Useful for tuning the parser against real certificates.

use clap::Args;

use crate::{acord::parse_certificate, models::OcrProvenance, prelude::*};

/// Parse-text command line arguments.
#[derive(Debug, Args)]
pub struct ParseTextOpts {
    /// Path to a UTF-8 text file of extracted certificate text.
    pub path: PathBuf,
}

/// The `parse-text` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_parse_text(opts: &ParseTextOpts) -> Result<()> {
    let text = tokio::fs::read_to_string(&opts.path)
        .await
        .with_context(|| format!("failed to read {:?}", opts.path))?;
    let result = parse_certificate(
        &text,
        OcrProvenance {
            provider: "text-file".to_owned(),
            meta: serde_json::json!({ "path": opts.path }),
        },
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
