//! Local heap command-line tool
//!
//! Works on a single heap file. Addresses accept decimal or `0x` hex.
//!
//! # Examples
//!
//! ```bash
//! # Create a heap with room for 128 bytes
//! lheap --file names.bin create --size-hint 128
//!
//! # Store NUL-terminated names and print their offsets
//! lheap --file names.bin insert --heap 0 alpha beta
//!
//! # Inspect the heap
//! lheap --file names.bin dump --heap 0
//! ```
//!
//! File space released in one run is not remembered by the next; new heaps
//! and grown data blocks always land past the current end of the file.

use clap::{Parser, Subcommand};
use localheap::{AccessMode, HeapConfig, LocalHeapStore};
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Local heap tool - persistent byte-string heaps in a binary file
#[derive(Parser, Debug)]
#[command(name = "lheap")]
#[command(version = localheap::VERSION)]
#[command(about = "Create, fill and inspect local heaps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Heap file path
    #[arg(long, global = true, default_value = "heap.bin", env = "LOCALHEAP_FILE")]
    file: PathBuf,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "LOCALHEAP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new heap and print its address
    Create {
        /// Initial data block size in bytes
        #[arg(long, default_value = "0")]
        size_hint: usize,
    },

    /// Insert strings (stored NUL-terminated) and print their offsets
    Insert {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
        /// Strings to insert
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Free a range of a heap
    Remove {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
        #[arg(long)]
        offset: usize,
        #[arg(long)]
        size: usize,
    },

    /// Print the NUL-terminated string at an offset
    Get {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
        #[arg(long)]
        offset: usize,
    },

    /// Dump a heap's layout, free list and data
    Dump {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print a heap's data block size and total storage size
    Size {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
    },

    /// Delete a heap and release its file space
    Delete {
        #[arg(long, value_parser = parse_addr)]
        heap: u64,
    },

    /// Print the effective configuration
    Config,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    let config = HeapConfig::load(cli.config.as_deref())?;
    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let store = LocalHeapStore::open(&cli.file, config)?;
    run(&store, cli.command)?;
    store.flush()?;

    let stats = store.cache_stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        writes = stats.writes,
        "Cache statistics"
    );
    Ok(())
}

/// Setup logging to stderr, plus rolling files when a log directory is given
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "lheap.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn run(store: &LocalHeapStore, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Create { size_hint } => {
            let addr = store.create(size_hint)?;
            println!("{:#x}", addr);
        }
        Commands::Insert { heap, values } => {
            let mut guard = store.protect(heap, AccessMode::ReadWrite)?;
            for value in values {
                let mut bytes = value.into_bytes();
                bytes.push(0);
                let offset = guard.insert(&bytes)?;
                println!("{}", offset);
            }
            guard.unprotect()?;
        }
        Commands::Remove { heap, offset, size } => {
            let mut guard = store.protect(heap, AccessMode::ReadWrite)?;
            guard.remove(offset, size)?;
            guard.unprotect()?;
        }
        Commands::Get { heap, offset } => {
            let guard = store.protect_read(heap)?;
            {
                let bytes = guard.offset_into(offset)?;
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                println!("{}", String::from_utf8_lossy(&bytes[..end]));
            }
            guard.unprotect()?;
        }
        Commands::Dump { heap, json } => {
            let report = store.report(heap)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }
        Commands::Size { heap } => {
            println!("data block: {} bytes", store.get_size(heap)?);
            println!("storage:    {} bytes", store.heap_storage_size(heap)?);
        }
        Commands::Delete { heap } => {
            store.delete(heap)?;
            println!("Deleted heap at {:#x}", heap);
        }
        Commands::Config => {}
    }
    Ok(())
}
