//! Send command: push one file to a receiver.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use jdc_core::client::SendSession;
use jdc_core::file::format_size;
use jdc_core::progress::{TransferPhase, TransferProgress};

use super::SendArgs;

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = args.to_config();
    config.validate().map_err(anyhow::Error::from)?;
    super::log_config(&config);

    let show_progress = config.show_progress;
    let session = SendSession::new(config).await?;

    let progress_handle = if show_progress {
        Some(tokio::spawn(display_progress(session.progress())))
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    super::spawn_signal_handler(shutdown.clone());

    let result = session.run(shutdown).await;

    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    result.map_err(anyhow::Error::from)
}

/// Render a single rewritten progress line until the transfer settles.
async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    let mut last_phase = TransferPhase::Preparing;

    loop {
        let changed = tokio::time::timeout(Duration::from_millis(500), rx.changed()).await;

        let progress = rx.borrow().clone();

        if progress.phase != last_phase {
            last_phase = progress.phase;
            match progress.phase {
                TransferPhase::Transferring => println!("  Transferring {}...", progress.filename),
                TransferPhase::Verifying => {
                    println!();
                    println!("  Verifying...");
                }
                TransferPhase::Completed => {
                    println!();
                    println!("  Transfer complete.");
                    break;
                }
                TransferPhase::Failed => {
                    println!();
                    break;
                }
                TransferPhase::Cancelled => {
                    println!();
                    println!("  Transfer cancelled.");
                    break;
                }
                TransferPhase::Preparing | TransferPhase::Negotiating => {}
            }
        }

        if progress.phase == TransferPhase::Transferring {
            print!(
                "\r  [{:>6.2}%] {}/{} chunks - {}/s   ",
                progress.percentage(),
                progress.chunks_done,
                progress.total_chunks,
                format_size(progress.rate_bps),
            );
            let _ = io::stdout().flush();
        }

        // Sender dropped: the session is gone either way.
        if matches!(changed, Ok(Err(_))) {
            break;
        }
    }
}
