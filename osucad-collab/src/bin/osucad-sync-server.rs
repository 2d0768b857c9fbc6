//! osucad sync server.
//!
//! ```text
//! osucad-sync-server serve --bind 0.0.0.0:9090 --data ./osucad_data
//! osucad-sync-server import map.osu [--id <uuid>]
//! osucad-sync-server export <uuid> > map.osu
//! osucad-sync-server list
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use osucad_collab::{ServerConfig, SyncServer};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// RocksDB directory. Without it documents live in memory only.
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket sync server
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:9090")]
        bind: String,

        #[arg(long, default_value_t = 100)]
        max_peers: usize,

        /// Sequenced operations between stored versions
        #[arg(long, default_value_t = 1000)]
        summary_interval: u64,
    },

    /// Create a document from a .osu file
    Import {
        file: PathBuf,

        /// Document id. A random one is chosen if not given.
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Print the latest state of a document as .osu text
    Export { id: Uuid },

    /// List stored documents
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = ServerConfig {
        storage_path: cli.data.clone(),
        ..ServerConfig::default()
    };
    if let Commands::Serve {
        bind,
        max_peers,
        summary_interval,
    } = &cli.command
    {
        config.bind_addr = bind.clone();
        config.max_peers_per_room = *max_peers;
        config.summary_interval_ops = *summary_interval;
    }
    if config.storage_path.is_none() && !matches!(cli.command, Commands::Serve { .. }) {
        log::warn!("No --data directory given; nothing will be persisted");
    }
    let server = SyncServer::new(config)?;

    match cli.command {
        Commands::Serve { .. } => {
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    let written = server.summarize_all().await?;
                    log::info!("Shutting down ({written} summaries written)");
                }
            }
        }
        Commands::Import { file, id } => {
            let text = std::fs::read_to_string(&file)?;
            let beatmap = osucad_core::parse(&text)?;
            let id = id.unwrap_or_else(Uuid::new_v4);
            server.import_beatmap(id, &beatmap)?;
            log::info!(
                "Imported {} ({} hit objects)",
                file.display(),
                beatmap.hit_objects.len()
            );
            println!("{id}");
        }
        Commands::Export { id } => {
            let beatmap = server.export_beatmap(id).await?;
            print!("{}", osucad_core::serialize(&beatmap));
        }
        Commands::List => {
            for record in server.list_documents()? {
                println!("{}  seq {:>8}  {}", record.id, record.sequence_number, record.head);
            }
        }
    }
    Ok(())
}
