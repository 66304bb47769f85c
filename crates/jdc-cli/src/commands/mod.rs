//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use jdc_core::config::Config;

pub mod send;
pub mod serve;

/// jdc - point-to-point large-file copier
#[derive(Parser)]
#[command(name = "jdc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Worker-thread hint for the runtime.
    pub fn workers(&self) -> usize {
        let common = match &self.command {
            Command::Serve(args) => &args.common,
            Command::Send(args) => &args.common,
        };
        common.workers.unwrap_or_else(default_workers).max(1)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| (n.get() / 2).max(1))
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Receive files (server mode)
    Serve(ServeArgs),

    /// Send a file to a receiver (client mode)
    Send(SendArgs),
}

/// Flags shared by both roles.
#[derive(Args)]
pub struct CommonArgs {
    /// Chunk size in bytes
    #[arg(long, default_value_t = jdc_core::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Stream buffer size in bytes
    #[arg(long, default_value_t = jdc_core::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Number of worker threads (defaults to half the CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable per-file compression
    #[arg(long)]
    pub compress: bool,

    /// Skip end-to-end hash verification
    #[arg(long)]
    pub no_verify: bool,

    /// Disable the progress display
    #[arg(long)]
    pub no_progress: bool,

    /// Per-operation timeout (e.g. 2m, 30s)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub timeout: Duration,

    /// Retry attempts per chunk
    #[arg(long, default_value_t = jdc_core::DEFAULT_RETRIES)]
    pub retries: u32,

    /// Base delay between chunk transfers (e.g. 10ms)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10ms")]
    pub chunk_delay: Duration,

    /// Scale the chunk delay with observed throughput
    #[arg(long)]
    pub adaptive: bool,

    /// Minimum adaptive delay
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1ms")]
    pub min_delay: Duration,

    /// Maximum adaptive delay
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    pub max_delay: Duration,
}

/// Arguments for `jdc serve`.
#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub listen: String,

    /// Directory to store received files
    #[arg(long, default_value = "./output")]
    pub output: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for `jdc send`.
#[derive(Args)]
pub struct SendArgs {
    /// Receiver address to connect to
    #[arg(long, default_value = "localhost:8000")]
    pub connect: String,

    /// File to transfer
    #[arg(long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl CommonArgs {
    fn apply(&self, config: &mut Config) {
        config.chunk_size = self.chunk_size;
        config.buffer_size = self.buffer_size;
        config.workers = self.workers.unwrap_or_else(default_workers).max(1);
        config.compression = self.compress;
        config.verify_hash = !self.no_verify;
        config.show_progress = !self.no_progress;
        config.timeout = self.timeout;
        config.retries = self.retries;
        config.chunk_delay = self.chunk_delay;
        config.adaptive_delay = self.adaptive;
        config.min_delay = self.min_delay;
        config.max_delay = self.max_delay;
    }
}

impl ServeArgs {
    /// Build the engine configuration for server mode.
    pub fn to_config(&self) -> Config {
        let mut config = Config {
            is_server: true,
            listen_address: self.listen.clone(),
            output_dir: self.output.clone(),
            ..Config::default()
        };
        self.common.apply(&mut config);
        config
    }
}

impl SendArgs {
    /// Build the engine configuration for client mode.
    pub fn to_config(&self) -> Config {
        let mut config = Config {
            is_server: false,
            server_address: self.connect.clone(),
            file_path: self.file.clone(),
            ..Config::default()
        };
        self.common.apply(&mut config);
        config
    }
}

/// Log the effective configuration once at startup.
pub fn log_config(config: &Config) {
    tracing::info!(
        mode = if config.is_server { "server" } else { "client" },
        chunk_size = %jdc_core::file::format_size(config.chunk_size),
        buffer_size = %jdc_core::file::format_size(config.buffer_size as u64),
        workers = config.workers,
        compression = config.compression,
        adaptive_delay = config.adaptive_delay,
        verify_hash = config.verify_hash,
        "Configuration loaded"
    );
}

/// Spawn a task that cancels the token on Ctrl-C.
pub fn spawn_signal_handler(shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
    });
}
