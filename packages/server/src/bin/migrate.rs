//! Applies pending database migrations and exits.

use anyhow::{Context, Result};
use clap::Parser;
use dispatcher_core::Config;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(about = "Run pending database migrations for the dispatcher")]
struct Args {
    /// Override DATABASE_URL instead of reading it from the environment.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let database_url = match args.database_url {
        Some(url) => url,
        None => Config::from_env()
            .context("failed to load configuration")?
            .database_url,
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migration failed")?;

    tracing::info!("migrations applied");
    Ok(())
}
