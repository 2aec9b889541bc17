//! End-to-end transfer tests: real RPC server, real tar streams.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use dutr::{RpcClient, pull_tar, push_tar};
use dutr_common::config::AgentConfig;
use dutrd::rpc::{self, AgentContext};

async fn start_agent() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = AgentConfig {
        bind_address: "127.0.0.1".to_string(),
        rpc_port: addr.port(),
        discovery_port: 0,
        log_level: "warn".to_string(),
    };
    let ctx = Arc::new(AgentContext::new(config));
    tokio::spawn(rpc::serve(listener, ctx));
    addr
}

/// Deterministic pseudo-random payload, no RNG dependency needed.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545f4914f6cdd1du64;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn write_send_tree(root: &Path) {
    std::fs::create_dir_all(root.join("bar")).unwrap();
    std::fs::write(root.join("foo.txt"), b"foo-contents").unwrap();
    std::fs::write(root.join("bar/baz.txt"), b"baz!").unwrap();
    std::fs::write(root.join("bat.txt"), b"bat-data").unwrap();
}

#[tokio::test]
async fn upload_acknowledges_content_bytes() {
    let addr = start_agent().await;
    let mut client = RpcClient::new("127.0.0.1", addr.port());

    let payload = noise(1024 * 1024);
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("in"), &payload).unwrap();
    let dest = tempfile::tempdir().unwrap();

    let port = client
        .upload(dest.path().to_str().unwrap(), true, 0)
        .await
        .unwrap();

    let acknowledged = push_tar("127.0.0.1", port, &src.path().join("in"))
        .await
        .unwrap();
    assert_eq!(acknowledged, payload.len() as u64);

    // Give the server a beat to finish the extraction bookkeeping.
    for _ in 0..100 {
        if dest.path().join("in").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(std::fs::read(dest.path().join("in")).unwrap(), payload);
}

#[tokio::test]
async fn upload_without_overwrite_fails_and_preserves_file() {
    let addr = start_agent().await;
    let mut client = RpcClient::new("127.0.0.1", addr.port());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("clash.txt"), b"new-bytes").unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("clash.txt"), b"old-bytes").unwrap();

    let port = client
        .upload(dest.path().to_str().unwrap(), false, 0)
        .await
        .unwrap();

    // The server rejects the collision and closes without a trailer.
    let err = push_tar("127.0.0.1", port, &src.path().join("clash.txt")).await;
    assert!(err.is_err());

    assert_eq!(
        std::fs::read(dest.path().join("clash.txt")).unwrap(),
        b"old-bytes"
    );
}

#[tokio::test]
async fn download_glob_returns_matching_subset() {
    let addr = start_agent().await;
    let mut client = RpcClient::new("127.0.0.1", addr.port());

    let dir = tempfile::tempdir().unwrap();
    let send = dir.path().join("send");
    write_send_tree(&send);

    let pattern = send.join("ba*");
    let (port, total) = client
        .download(pattern.to_str().unwrap(), 0)
        .await
        .unwrap();
    assert_eq!(total, 4 + 8, "baz! plus bat-data");

    let out = tempfile::tempdir().unwrap();
    pull_tar("127.0.0.1", port, out.path()).await.unwrap();

    assert_eq!(
        std::fs::read(out.path().join("bar/baz.txt")).unwrap(),
        b"baz!"
    );
    assert_eq!(std::fs::read(out.path().join("bat.txt")).unwrap(), b"bat-data");
    assert!(!out.path().join("foo.txt").exists());
}

#[tokio::test]
async fn upload_then_download_roundtrips_a_tree() {
    let addr = start_agent().await;
    let mut client = RpcClient::new("127.0.0.1", addr.port());

    let src = tempfile::tempdir().unwrap();
    let send = src.path().join("send");
    write_send_tree(&send);

    // Push the whole directory up.
    let remote = tempfile::tempdir().unwrap();
    let port = client
        .upload(remote.path().to_str().unwrap(), true, 0)
        .await
        .unwrap();
    let pushed = push_tar("127.0.0.1", port, &send).await.unwrap();
    assert_eq!(pushed, 4 + 8 + 12);

    // Pull it back down.
    let remote_send = remote.path().join("send");
    let (port, total) = client
        .download(remote_send.to_str().unwrap(), 0)
        .await
        .unwrap();
    assert_eq!(total, pushed);

    let out = tempfile::tempdir().unwrap();
    pull_tar("127.0.0.1", port, out.path()).await.unwrap();

    for rel in ["foo.txt", "bar/baz.txt", "bat.txt"] {
        assert_eq!(
            std::fs::read(out.path().join(rel)).unwrap(),
            std::fs::read(send.join(rel)).unwrap(),
            "mismatch for {rel}"
        );
    }
}

#[tokio::test]
async fn download_of_missing_path_is_an_rpc_error() {
    let addr = start_agent().await;
    let mut client = RpcClient::new("127.0.0.1", addr.port());

    let err = client.download("/no/such/path/anywhere", 0).await.unwrap_err();
    assert!(err.to_string().contains("transfer protocol"), "got {err}");
}

#[tokio::test]
async fn discovery_probe_finds_the_agent() {
    // Discovery runs separately from the RPC server in this test; bind
    // a probe socket first to learn a free UDP port.
    let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let discovery_port = probe.local_addr().unwrap().port();
    drop(probe);

    tokio::spawn(async move {
        let _ = dutrd::discovery::run("127.0.0.1", discovery_port, 8472).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (agent, rpc_port) = dutr::discover("127.0.0.1", discovery_port, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(rpc_port, 8472);
    assert_eq!(agent.ip().to_string(), "127.0.0.1");
}
