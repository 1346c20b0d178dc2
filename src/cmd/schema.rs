//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    models::{ParseDocumentResponse, ParseResult},
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// The structured result of parsing a certificate.
    ParseResult,
    /// The response to a "parse document" trigger.
    ParseDocumentResponse,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::ParseResult => schema_for!(ParseResult),
        SchemaType::ParseDocumentResponse => schema_for!(ParseDocumentResponse),
    };

    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    match &schema_opts.output_path {
        Some(path) => tokio::fs::write(path, schema_str.as_bytes())
            .await
            .with_context(|| format!("failed to write {path:?}"))?,
        None => println!("{schema_str}"),
    }
    Ok(())
}
