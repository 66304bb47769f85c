//! Shared helpers for the integration suite.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jdc_core::config::Config;
use jdc_core::server::Server;

/// A receiver running in a background task.
pub struct TestServer {
    /// Bound address
    pub addr: SocketAddr,
    /// Cancel to stop the accept loop
    pub shutdown: CancellationToken,
    /// Serve task handle
    pub handle: tokio::task::JoinHandle<jdc_core::Result<()>>,
}

impl TestServer {
    /// Stop the server and wait for the accept loop to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Bind and spawn a receiver with the given configuration.
pub async fn start_server(config: Config) -> TestServer {
    let server = Server::bind(config).await.expect("bind server");
    let addr = server.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { server.serve(token).await });
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

/// Server configuration tuned for tests: ephemeral port, no pacing.
pub fn server_config(output_dir: &Path, chunk_size: u64, verify: bool) -> Config {
    Config {
        is_server: true,
        listen_address: "127.0.0.1:0".to_string(),
        output_dir: output_dir.to_path_buf(),
        chunk_size,
        buffer_size: 64 * 1024,
        workers: 2,
        verify_hash: verify,
        show_progress: false,
        timeout: Duration::from_secs(10),
        retries: 3,
        chunk_delay: Duration::ZERO,
        ..Config::default()
    }
}

/// Client configuration pointed at a test server.
pub fn client_config(addr: SocketAddr, file_path: &Path, chunk_size: u64, verify: bool) -> Config {
    Config {
        is_server: false,
        server_address: addr.to_string(),
        file_path: file_path.to_path_buf(),
        chunk_size,
        buffer_size: 64 * 1024,
        workers: 2,
        verify_hash: verify,
        show_progress: false,
        timeout: Duration::from_secs(10),
        retries: 3,
        chunk_delay: Duration::ZERO,
        ..Config::default()
    }
}

/// Deterministic low-byte content; never collides with the 0xAA sentinel
/// used by the resume tests.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 7) as u8).collect()
}

/// Answer profiling pings on a connection until the peer closes it.
///
/// Scripted-server tests hand the client's second (profiling) connection to
/// this helper so the main scripted conversation stays linear.
pub async fn answer_pings(stream: tokio::net::TcpStream) {
    use jdc_core::protocol::{self, Command};
    use tokio::io::{BufReader, BufWriter};

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    while let Ok(Command::Ping) = protocol::read_command(&mut reader).await {
        if protocol::send_command(&mut writer, Command::Pong).await.is_err() {
            return;
        }
        if protocol::flush(&mut writer).await.is_err() {
            return;
        }
    }
}
