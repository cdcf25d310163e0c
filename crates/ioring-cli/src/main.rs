//! ioring CLI
//!
//! Inspect the ring backend and move file data through it.

mod config;
mod progress;
mod transfer;

use clap::{Parser, Subcommand};
use ioring::{BackendKind, IoRing, OpenMode, Operation};
use std::io;
use std::path::PathBuf;
use std::time::{Instant, UNIX_EPOCH};

use config::Config;
use progress::{format_rate, format_size};
use transfer::RingFile;

/// ioring - batched asynchronous file I/O
#[derive(Parser)]
#[command(name = "ioring")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend to use (auto, io_uring, emulated); overrides the config file
    #[arg(long)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the backend, queue sizes and supported operations
    Probe,

    /// Show file metadata
    Stat {
        /// File to inspect
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Print a file to standard output
    Cat {
        /// File to print
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Copy a file with pipelined reads and writes
    Copy {
        /// Source file
        #[arg(required = true)]
        source: PathBuf,

        /// Destination file, created or truncated
        #[arg(required = true)]
        destination: PathBuf,

        /// Bytes per request
        #[arg(long)]
        block_size: Option<usize>,

        /// Requests kept in flight
        #[arg(long)]
        queue_depth: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(backend) = cli.backend {
        config.ring.backend = backend;
    }
    if let Commands::Copy {
        block_size,
        queue_depth,
        ..
    } = &cli.command
    {
        if let Some(block_size) = block_size {
            config.transfer.block_size = *block_size;
        }
        if let Some(queue_depth) = queue_depth {
            config.transfer.queue_depth = *queue_depth;
        }
    }

    // Validate configuration
    config.validate()?;

    // Initialize logging; stdout carries file data for `cat`
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(io::stderr)
        .init();

    let ring = IoRing::with_config(config.ring.clone());
    if !ring.ensure_initialized() {
        anyhow::bail!("failed to initialize the {} backend", config.ring.backend);
    }

    match cli.command {
        Commands::Probe => probe(&ring),
        Commands::Stat { file } => stat(&ring, file)?,
        Commands::Cat { file } => {
            let mut stdout = io::stdout().lock();
            transfer::cat(&ring, &file, &mut stdout, &config.transfer)?;
        }
        Commands::Copy {
            source,
            destination,
            no_progress,
            ..
        } => {
            let started = Instant::now();
            let copied = transfer::copy(
                &ring,
                &source,
                &destination,
                &config.transfer,
                !no_progress,
            )?;
            let elapsed = started.elapsed();
            println!(
                "{} copied in {:.2?} ({})",
                format_size(copied),
                elapsed,
                format_rate(copied, elapsed)
            );
        }
    }

    Ok(())
}

/// Print what the ring runs on
fn probe(ring: &IoRing) {
    let backend = ring
        .backend_kind()
        .map_or_else(|| "none".to_string(), |kind| kind.to_string());
    println!("backend:          {backend}");
    println!("submission queue: {} entries", ring.submission_queue_size());
    println!("completion queue: {} entries", ring.completion_queue_size());
    println!("operations:");
    for operation in Operation::ALL {
        let status = if ring.supports_operation(operation) {
            "supported"
        } else {
            "unsupported"
        };
        println!("  {:<8} {status}", operation.name());
    }
}

/// Print file metadata gathered through the ring
fn stat(ring: &IoRing, file: PathBuf) -> anyhow::Result<()> {
    let opened = RingFile::open(ring, &file, OpenMode::READ_ONLY)?;
    let stat = opened.stat()?;
    opened.close()?;

    let kind = if stat.is_dir() {
        "directory"
    } else if stat.is_file() {
        "regular file"
    } else {
        "other"
    };
    println!("file:     {}", file.display());
    println!("type:     {kind}");
    println!("size:     {} ({})", stat.size, format_size(stat.size));
    println!("mode:     {:o}", stat.mode & 0o7777);
    if let Some(modified) = stat.modified {
        if let Ok(since_epoch) = modified.duration_since(UNIX_EPOCH) {
            println!("modified: {} (unix seconds)", since_epoch.as_secs());
        }
    }
    Ok(())
}
