//! End-to-end transfers over localhost TCP.

mod common;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use jdc_core::client::SendSession;
use jdc_core::protocol::{self, Command, ResumeInfo};
use jdc_core::state::STATE_FILE_EXT;

use common::{client_config, server_config, start_server, test_pattern};

const MIB: u64 = 1024 * 1024;

async fn transfer(
    content: &[u8],
    file_name: &str,
    chunk_size: u64,
    verify: bool,
    compression: bool,
) -> (tempfile::TempDir, tempfile::TempDir) {
    let src_dir = tempfile::TempDir::new().expect("source dir");
    let out_dir = tempfile::TempDir::new().expect("output dir");

    let source = src_dir.path().join(file_name);
    std::fs::write(&source, content).expect("write source");

    let server = start_server(server_config(out_dir.path(), chunk_size, verify)).await;

    let mut config = client_config(server.addr, &source, chunk_size, verify);
    config.compression = compression;

    let session = SendSession::new(config).await.expect("create session");
    session
        .run(CancellationToken::new())
        .await
        .expect("transfer should succeed");

    server.stop().await;

    let received = std::fs::read(out_dir.path().join(file_name)).expect("read output");
    assert_eq!(received.len(), content.len(), "output size must match");
    assert_eq!(received, content, "output must be byte-identical");

    let state = out_dir.path().join(format!("{file_name}{STATE_FILE_EXT}"));
    assert!(!state.exists(), "state file must be gone after completion");

    (src_dir, out_dir)
}

#[tokio::test]
async fn test_small_file_single_chunk() {
    // 56 bytes in a 1 MiB grid: one chunk, no verification.
    let content = test_pattern(56);
    transfer(&content, "tiny.bin", MIB, false, false).await;
}

#[tokio::test]
async fn test_multi_chunk_boundary() {
    // 3 MiB + 1 byte with 1 MiB chunks: four chunks, the last one byte long.
    let content = test_pattern(3 * 1024 * 1024 + 1);
    transfer(&content, "boundary.bin", MIB, false, false).await;
}

#[tokio::test]
async fn test_verified_transfer() {
    let content = test_pattern(2 * 1024 * 1024 + 123);
    transfer(&content, "verified.bin", 512 * 1024, true, false).await;
}

#[tokio::test]
async fn test_compressed_text_transfer() {
    let content = b"status=ok line with plenty of repetition\n"
        .repeat(40_000)
        .to_vec();
    transfer(&content, "server.log", MIB, true, true).await;
}

#[tokio::test]
async fn test_uneven_chunk_size() {
    // A chunk size that doesn't divide the file exercises the short tail.
    let content = test_pattern(1_000_000);
    transfer(&content, "uneven.bin", 333_333, true, false).await;
}

/// Scripted receiver that records the compression flag of every data frame.
/// A `.zip` source must arrive with every flag zero even when compression is
/// requested.
#[tokio::test]
async fn test_already_compressed_file_is_sent_raw() {
    let src_dir = tempfile::TempDir::new().expect("source dir");
    let source = src_dir.path().join("bundle.zip");
    let content = test_pattern(2 * 1024 * 1024);
    std::fs::write(&source, &content).expect("write source");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let chunk_size = MIB;
    let expected = content.clone();

    let script = tokio::spawn(async move {
        // The client connects its transfer stream first, then the profiler.
        let (main_stream, _) = listener.accept().await.expect("accept transfer");
        let (prof_stream, _) = listener.accept().await.expect("accept profiler");
        tokio::spawn(common::answer_pings(prof_stream));

        let (read_half, write_half) = main_stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let first = protocol::read_command(&mut reader).await.expect("first");
        assert_eq!(first, Command::Init);
        let filename = protocol::read_line(&mut reader).await.expect("filename");
        assert_eq!(filename, "bundle.zip");
        let file_size = protocol::read_u64(&mut reader).await.expect("size");
        assert_eq!(file_size, expected.len() as u64);
        let _verify = protocol::read_bool(&mut reader).await.expect("verify");

        protocol::send_resume_info(&mut writer, &ResumeInfo::default())
            .await
            .expect("resume info");
        let ack_cmd = protocol::read_command(&mut reader).await.expect("ack cmd");
        assert_eq!(ack_cmd, Command::ResumeAck);
        protocol::read_resume_ack(&mut reader).await.expect("ack");

        let num_chunks = file_size.div_ceil(chunk_size);
        let mut flags = Vec::new();
        let mut received = vec![0u8; expected.len()];
        for index in 0..num_chunks {
            let offset = index * chunk_size;
            protocol::send_command(&mut writer, Command::Request)
                .await
                .expect("request");
            protocol::send_u64(&mut writer, offset).await.expect("offset");
            protocol::flush(&mut writer).await.expect("flush");

            let data_cmd = protocol::read_command(&mut reader).await.expect("data cmd");
            assert_eq!(data_cmd, Command::Data);
            let size = protocol::read_u64(&mut reader).await.expect("size");
            let flag = protocol::read_flag(&mut reader).await.expect("flag");
            flags.push(flag);
            assert_eq!(flag, 0, "already-compressed files must be sent raw");

            let start = usize::try_from(offset).expect("offset fits");
            let end = start + usize::try_from(size).expect("size fits");
            protocol::read_exact(&mut reader, &mut received[start..end])
                .await
                .expect("payload");
        }
        assert_eq!(received, expected);

        protocol::send_command(&mut writer, Command::Complete)
            .await
            .expect("complete");
        protocol::flush(&mut writer).await.expect("flush");
        flags
    });

    let mut config = client_config(addr, &source, chunk_size, false);
    config.compression = true;
    let session = SendSession::new(config).await.expect("create session");
    session
        .run(CancellationToken::new())
        .await
        .expect("transfer should succeed");

    let flags = script.await.expect("script task");
    assert_eq!(flags.len(), 2, "2 MiB / 1 MiB = two data frames");
    assert!(flags.iter().all(|f| *f == 0));
}

/// Scripted receiver using the legacy verification path: a bare `Hash`
/// request with no preceding `HashAlgo` implies md5.
#[tokio::test]
async fn test_legacy_hash_request_implies_md5() {
    let src_dir = tempfile::TempDir::new().expect("source dir");
    let source = src_dir.path().join("data.bin");
    let content = test_pattern(1024 * 1024 + 9);
    std::fs::write(&source, &content).expect("write source");

    let expected_md5 = jdc_core::hash::hash_file(&source, jdc_core::hash::HashAlgorithm::Md5)
        .await
        .expect("hash source");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let chunk_size = MIB;
    let expected = content.clone();

    let script = tokio::spawn(async move {
        let (main_stream, _) = listener.accept().await.expect("accept transfer");
        let (prof_stream, _) = listener.accept().await.expect("accept profiler");
        tokio::spawn(common::answer_pings(prof_stream));

        let (read_half, write_half) = main_stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let first = protocol::read_command(&mut reader).await.expect("first");
        assert_eq!(first, Command::Init);
        protocol::read_line(&mut reader).await.expect("filename");
        let file_size = protocol::read_u64(&mut reader).await.expect("size");
        protocol::read_bool(&mut reader).await.expect("verify");

        protocol::send_resume_info(&mut writer, &ResumeInfo::default())
            .await
            .expect("resume info");
        let ack_cmd = protocol::read_command(&mut reader).await.expect("ack cmd");
        assert_eq!(ack_cmd, Command::ResumeAck);
        protocol::read_resume_ack(&mut reader).await.expect("ack");

        let num_chunks = file_size.div_ceil(chunk_size);
        let mut received = vec![0u8; expected.len()];
        for index in 0..num_chunks {
            let offset = index * chunk_size;
            protocol::send_command(&mut writer, Command::Request)
                .await
                .expect("request");
            protocol::send_u64(&mut writer, offset).await.expect("offset");
            protocol::flush(&mut writer).await.expect("flush");

            let data_cmd = protocol::read_command(&mut reader).await.expect("data cmd");
            assert_eq!(data_cmd, Command::Data);
            let size = protocol::read_u64(&mut reader).await.expect("size");
            let flag = protocol::read_flag(&mut reader).await.expect("flag");
            assert_eq!(flag, 0);

            let start = usize::try_from(offset).expect("offset fits");
            let end = start + usize::try_from(size).expect("size fits");
            protocol::read_exact(&mut reader, &mut received[start..end])
                .await
                .expect("payload");
        }
        assert_eq!(received, expected);

        // Legacy path: no HashAlgo frame, just the bare request.
        protocol::send_command(&mut writer, Command::Hash)
            .await
            .expect("hash request");
        protocol::flush(&mut writer).await.expect("flush");

        let answer = protocol::read_command(&mut reader).await.expect("answer");
        assert_eq!(answer, Command::Hash);
        let digest = protocol::read_line(&mut reader).await.expect("digest");
        digest_matches(&digest);

        protocol::send_command(&mut writer, Command::Hash)
            .await
            .expect("verdict");
        protocol::send_line(&mut writer, protocol::HASH_VERIFIED)
            .await
            .expect("verified");
        protocol::send_command(&mut writer, Command::Complete)
            .await
            .expect("complete");
        protocol::flush(&mut writer).await.expect("flush");

        digest
    });

    // The client opted into verification so it answers the hash request.
    let session = SendSession::new(client_config(addr, &source, chunk_size, true))
        .await
        .expect("create session");
    session
        .run(CancellationToken::new())
        .await
        .expect("transfer should succeed");

    let digest = script.await.expect("script task");
    assert_eq!(digest, expected_md5, "legacy request must be answered with md5");
    assert_eq!(digest.len(), 32);
}

fn digest_matches(digest: &str) {
    assert_eq!(digest.len(), 32, "md5 digest is 32 hex chars: {digest}");
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
}
