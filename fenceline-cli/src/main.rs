//! Fenceline CLI.
//!
//! Thin shell around the `fenceline` library: configuration, logging
//! bootstrap, fence administration, and the reference transport adapter
//! (`serve`) that feeds location samples to the transition engine over
//! newline-delimited JSON.

mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fenceline::geo::Coordinate;
use fenceline::queue::{EventQueue, EventWorker, PresenceReadModel, ReadModel};
use fenceline::{PipelineConfig, SqliteStore, TransitionEngine};

#[derive(Parser)]
#[command(
    name = "fenceline",
    about = "Geofence transition detection and event pipeline",
    version
)]
struct Cli {
    /// Path to the SQLite database (created on first use).
    #[arg(long, default_value = "fenceline.db", global = true)]
    db: PathBuf,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion adapter and the event worker.
    Serve {
        /// Address to listen on for newline-delimited JSON location updates.
        #[arg(long, default_value = "127.0.0.1:7878")]
        listen: String,
    },

    /// Create a fence.
    AddFence {
        /// Fence name.
        name: String,
        /// Center latitude in degrees.
        #[arg(long)]
        lat: f64,
        /// Center longitude in degrees.
        #[arg(long)]
        lon: f64,
        /// Radius in metres.
        #[arg(long)]
        radius: f64,
        /// Owner identity (receives transition alerts).
        #[arg(long)]
        owner: String,
    },

    /// List all fences.
    ListFences,

    /// Delete a fence by id.
    DeleteFence {
        /// Fence id as reported by add-fence / list-fences.
        id: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteStore::open(&cli.db)?);

    match cli.command {
        Command::Serve { listen } => {
            let config = PipelineConfig::default();
            let engine = Arc::new(TransitionEngine::new(Arc::clone(&store), &config));
            let presence = Arc::new(PresenceReadModel::new(&store));
            let worker = EventWorker::new(
                EventQueue::new(&store),
                presence as Arc<dyn ReadModel>,
                &config,
            );
            server::serve(&listen, engine, worker).await
        }
        Command::AddFence {
            name,
            lat,
            lon,
            radius,
            owner,
        } => {
            let center = Coordinate::new(lat, lon)?;
            let fence = store.insert_fence(&name, center, radius, &owner)?;
            info!(id = fence.id, name = %fence.name, "fence created");
            println!("{}", serde_json::to_string(&fence)?);
            Ok(())
        }
        Command::ListFences => {
            for fence in store.load_fences()? {
                println!("{}", serde_json::to_string(&fence)?);
            }
            Ok(())
        }
        Command::DeleteFence { id } => {
            if store.delete_fence(id)? {
                info!(id, "fence deleted");
            } else {
                eprintln!("no fence with id {id}");
            }
            Ok(())
        }
    }
}
