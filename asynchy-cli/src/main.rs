use asynchy::{expand_home, AsynchyError, Config, SortOrder};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod progress;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "asynchy")]
struct Cli {
    /// Configuration file (defaults to ~/.asynchy.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
pub struct InitArgs {
    /// Remote host to pull from
    #[arg(long)]
    host: String,
    /// SSH port
    #[arg(long, default_value = "22")]
    port: u16,
    /// Remote login
    #[arg(long)]
    user: String,
    /// Private key used for the ssh connection
    #[arg(long)]
    keypath: PathBuf,
    /// Catalog database
    #[arg(long, default_value = "files.db")]
    db: PathBuf,
    /// Number of concurrent transfers
    #[arg(long)]
    threads: Option<usize>,
    /// Replace an existing configuration
    #[arg(long)]
    overwrite: bool,
}

#[derive(clap::Args)]
pub struct SyncArgs {
    /// Local directory the items are copied into
    #[arg(long, default_value = ".")]
    dest: PathBuf,
    /// Remote directory holding the items
    #[arg(long, default_value = "/")]
    src_prefix: String,
    /// Take items oldest first (asc) or newest first (desc)
    #[arg(long, default_value = "asc")]
    order: SortOrder,
    /// Maximum number of items to transfer (0 for no limit)
    #[arg(long, default_value = "50")]
    limit: usize,
    /// Number of concurrent transfers
    #[arg(long)]
    threads: Option<usize>,
    /// Extra ssh connection attempts
    #[arg(long)]
    retry: Option<u32>,
    /// Keep partially transferred files
    #[arg(long)]
    partial: bool,
    /// Compress data in transit
    #[arg(long)]
    compress: bool,
    /// Write Prometheus metrics to this file after the run
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        #[command(flatten)]
        args: InitArgs,
    },
    /// Transfer incomplete items from the catalog
    Sync {
        #[command(flatten)]
        args: SyncArgs,
    },
    /// Inspect or edit the catalog
    Catalog {
        /// Catalog database (defaults to the one in the configuration)
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(subcommand)]
        command: CatalogCommands,
    },
}

#[derive(Subcommand)]
pub enum CatalogCommands {
    /// Create the catalog tables
    Init,
    /// Add or refresh an item
    Add {
        /// Item key, relative to the source prefix
        key: String,
        /// Expected size in bytes
        size: u64,
        /// Modification time (RFC 3339, defaults to now)
        #[arg(long)]
        modified: Option<String>,
    },
    /// List items still to be transferred
    Pending {
        #[arg(long, default_value = "asc")]
        order: SortOrder,
        #[arg(long)]
        limit: Option<usize>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "asynchy=debug"
    } else {
        "asynchy=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli
        .config
        .map(|path| expand_home(&path))
        .unwrap_or_else(Config::default_path);

    // Execute command
    let result = match cli.command {
        Commands::Init { args } => cli::handle_init(&config_path, args).await,
        Commands::Sync { args } => cli::handle_sync(&config_path, args).await,
        Commands::Catalog { db, command } => cli::handle_catalog(&config_path, db, command).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<AsynchyError>()
                .map(AsynchyError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
