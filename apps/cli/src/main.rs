//! qget CLI - queue-based segmented downloader
//!
//! Every command loads the manager state file, applies one operation through
//! the core API and writes the state back. `run` drives the queued transfers.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// qget - download queues with time windows and bandwidth limits
#[derive(Parser)]
#[command(name = "qget")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// State file holding queues and downloads
    #[arg(long, env = "QGET_STATE")]
    state: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new download
    Add {
        /// URL to download
        url: String,

        /// Queue to add to
        #[arg(short, long, default_value = commands::DEFAULT_QUEUE)]
        queue: String,

        /// Output file name (defaults to the last URL path segment)
        #[arg(short, long)]
        name: Option<String>,

        /// Destination directory (defaults to the queue's save path)
        #[arg(short, long)]
        dest: Option<PathBuf>,
    },

    /// List downloads
    List {
        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Cancel and forget a download
    Remove {
        /// Download ID
        id: u64,
    },

    /// Pause a download
    Pause {
        /// Download ID
        id: u64,
    },

    /// Resume a paused, failed or cancelled download
    Resume {
        /// Download ID
        id: u64,
    },

    /// Queue management
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run queued downloads with live progress
    Run {
        /// Keep running after every dispatched download settled
        #[arg(long)]
        keep_alive: bool,
    },
}

/// Queue policy flags shared by `queue add` and `queue update`
#[derive(clap::Args)]
struct QueueOptions {
    /// Directory finished files are written to
    #[arg(long)]
    path: Option<PathBuf>,

    /// Downloads running at once
    #[arg(long)]
    concurrency: Option<u32>,

    /// Extra attempts after a failure
    #[arg(long)]
    retries: Option<u32>,

    /// Daily active window, e.g. 01:00-06:00
    #[arg(long)]
    window: Option<String>,

    /// Bandwidth limit in KiB/s (0 = unlimited)
    #[arg(long)]
    bandwidth: Option<u64>,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List all queues
    List,

    /// Create a new queue
    Add {
        /// Queue name
        name: String,

        #[command(flatten)]
        options: QueueOptions,
    },

    /// Change a queue's policy
    Update {
        /// Queue name
        name: String,

        #[command(flatten)]
        options: QueueOptions,
    },

    /// Cancel a queue's downloads and delete the queue
    Remove {
        /// Queue name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,qget_core=debug"
    } else {
        "warn,qget_core=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    // Determine state file
    let state = cli.state.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("qget"))
            .unwrap_or_else(|| PathBuf::from(".qget"))
            .join("state.json")
    });
    let ctx = commands::Context::load(state).await?;

    match cli.command {
        Commands::Add {
            url,
            queue,
            name,
            dest,
        } => commands::add_download(&ctx, url, queue, name, dest, cli.output).await?,

        Commands::List { all } => commands::list_downloads(&ctx, all, cli.output).await?,

        Commands::Remove { id } => commands::remove_download(&ctx, id, cli.output).await?,

        Commands::Pause { id } => commands::pause_download(&ctx, id, cli.output).await?,

        Commands::Resume { id } => commands::resume_download(&ctx, id, cli.output).await?,

        Commands::Queue { action } => commands::queue_action(&ctx, action, cli.output).await?,

        Commands::Run { keep_alive } => commands::run(&ctx, keep_alive, cli.output).await?,
    }

    Ok(())
}
