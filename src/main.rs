pub mod config;
pub mod types;
pub mod reconcile;
pub mod data;
pub mod dem;
pub mod preprocess;
pub mod server;
pub mod qc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clean the raw ward/school/tree/DEM datasets and export the processed artifacts
    Preprocess {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the processed map data, tile pyramids and the ward API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Render a QC overview PNG of the processed layers
    Qc {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Preprocess { config } => {
            println!("Preprocessing with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;
            preprocess::run(&app_config)?;
            println!("Preprocessing complete!");
        }
        Commands::Serve { config } => {
            println!("Serving map with config: {:?}", config);
            let app_config = config::AppConfig::load_from_file(config)?;

            // Build the session context once; every lookup table is read-only
            // from here on and shared by reference through the server state.
            println!("Loading processed data for API...");
            let ctx = data::WardContext::load(&app_config);

            server::start_server(app_config, ctx).await?;
        }
        Commands::Qc { config } => {
            let app_config = config::AppConfig::load_from_file(config)?;
            qc::render(&app_config)?;
        }
    }

    Ok(())
}
