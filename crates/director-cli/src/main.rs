use std::path::PathBuf;

use clap::{Parser, Subcommand};
use director_core::DirectorConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "director",
    about = "Director — inspect deployed instance records",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to director.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// State store file, overriding [store].path from the config
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the instances of a deployment
    Instances {
        /// Deployment name
        #[arg(short, long)]
        deployment: String,
    },
    /// Show an instance with its active disk and archive status as JSON
    Show {
        instance_id: u64,
    },
    /// Delete every rendered templates archive of an instance except the latest
    PruneArchives {
        instance_id: u64,
        /// List what would be removed without deleting it
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DirectorConfig::from_file(path)?,
        None => DirectorConfig::default(),
    };
    if let Some(path) = cli.store {
        config.store.path = Some(path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = commands::open_store(&config)?;

    match cli.command {
        Commands::Instances { deployment } => commands::instances::list(&store, &deployment),
        Commands::Show { instance_id } => commands::show::show(&store, instance_id),
        Commands::PruneArchives { instance_id, dry_run } => {
            commands::prune::prune_archives(&store, instance_id, dry_run)
        }
    }
}
