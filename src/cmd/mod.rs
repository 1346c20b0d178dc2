//! Command-line entry points.

use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::prelude::*;

pub mod migrate;
pub mod parse;
pub mod parse_text;
pub mod schema;

/// Connect to the database named by `DATABASE_URL`.
pub async fn connect_pool() -> Result<PgPool> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")
}
