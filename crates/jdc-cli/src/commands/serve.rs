//! Serve command: run the receiver until interrupted.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use jdc_core::server::Server;

use super::ServeArgs;

/// Run the serve command.
pub async fn run(args: ServeArgs) -> Result<()> {
    let config = args.to_config();
    config.validate().map_err(anyhow::Error::from)?;
    super::log_config(&config);

    let server = Server::bind(config).await?;
    tracing::info!(address = %server.local_addr()?, "Listening");

    let shutdown = CancellationToken::new();
    super::spawn_signal_handler(shutdown.clone());

    server.serve(shutdown.clone()).await?;

    if shutdown.is_cancelled() {
        // Give in-flight transfer tasks a moment to persist their state.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        return Err(jdc_core::Error::Cancelled.into());
    }
    Ok(())
}
