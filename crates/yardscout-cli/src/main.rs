use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use yardscout_pipeline::{Pipeline, PipelineConfig};
use yardscout_storage::SqliteStore;

#[derive(Debug, Parser)]
#[command(name = "yardscout")]
#[command(about = "Salvage-yard inventory tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch all enabled yard listings and reconcile the inventory.
    Refresh,
    /// Run the web UI and JSON API.
    Serve,
}

async fn build_pipeline() -> Result<Arc<Pipeline>> {
    let config = PipelineConfig::from_env();
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    Ok(Arc::new(Pipeline::new(config, store)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Refresh) {
        Commands::Refresh => {
            let pipeline = build_pipeline().await?;
            let summary = pipeline.run_once().await?;
            println!("refresh {}: {}", summary.run_id, summary.message);
        }
        Commands::Serve => {
            let pipeline = build_pipeline().await?;
            yardscout_web::serve(pipeline).await?;
        }
    }

    Ok(())
}
