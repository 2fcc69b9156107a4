//! Zeromux CLI - headless probe and player for segmented MP4 streams
//!
//! Features:
//! - Segment index inspection
//! - Headless playback into an in-memory buffer
//! - Machine-readable error envelopes

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

/// Zeromux CLI - segmented MP4 streaming toolkit
#[derive(Parser)]
#[command(name = "zeromux-cli")]
#[command(version)]
#[command(about = "Probe and play segmented MP4 streams", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Streamer configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and decode a file.json segment index
    Probe {
        /// URL of file.json
        metadata: String,
    },

    /// Bootstrap a stream and play it into an in-memory buffer
    Play {
        /// URL of file.json
        metadata: String,

        /// URL of the moov box
        header: String,

        /// Codec descriptor, e.g. 'video/mp4; codecs="avc1.64001f"'
        #[arg(long, default_value = "video/mp4")]
        codec: String,

        /// Seconds of media to play before stopping
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
    zeromux_core::init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Probe { metadata } => {
            commands::probe(&metadata, &config, &cli.format).await?;
        }
        Commands::Play {
            metadata,
            header,
            codec,
            seconds,
        } => {
            commands::play(&metadata, &header, &codec, seconds, config, &cli.format).await?;
        }
    }

    Ok(())
}
