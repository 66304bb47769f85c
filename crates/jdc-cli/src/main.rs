//! jdc - point-to-point large-file copier.
//!
//! One sender, one receiver, one TCP connection. Transfers are chunked,
//! resumable, optionally compressed, and optionally verified end to end.
//!
//! ## Quick Start
//!
//! ```bash
//! # Receive into ./output (on the destination host)
//! jdc serve --listen 0.0.0.0:8000 --output ./output
//!
//! # Send a file (on the source host)
//! jdc send --connect dest:8000 --file ./dataset.bin
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use clap::Parser;

mod commands;

use commands::{Cli, Command};

/// Exit code for a graceful shutdown, distinct from success and failure.
const EXIT_CANCELLED: i32 = 130;

fn main() {
    init_logging();

    let cli = Cli::parse();
    let workers = cli.workers();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Serve(args) => commands::serve::run(args).await,
            Command::Send(args) => commands::send::run(args).await,
        }
    });

    match result {
        Ok(()) => {}
        Err(e) if is_cancelled(&e) => {
            tracing::info!("Shut down gracefully");
            std::process::exit(EXIT_CANCELLED);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<jdc_core::Error>(),
        Some(jdc_core::Error::Cancelled)
    )
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,jdc=info,jdc_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
