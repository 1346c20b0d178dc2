//! The `migrate` subcommand.

use clap::Args;

use crate::{db::pg::run_migrations, prelude::*};

use super::connect_pool;

/// Migrate command line arguments.
#[derive(Debug, Args)]
pub struct MigrateOpts {}

/// The `migrate` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_migrate(_opts: &MigrateOpts) -> Result<()> {
    let pool = connect_pool().await?;
    run_migrations(&pool).await?;
    info!("migrations complete");
    Ok(())
}
