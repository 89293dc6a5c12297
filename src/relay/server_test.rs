// ============================================================================
// Relay End-to-End Tests
// ============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use frame_source::{Frame, PatternSource};
use futures::SinkExt;
use tokio::net::TcpListener;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::RelayServer;
use crate::media::testing::{fast_options, pattern_config, wait_until};
use crate::media::{Consumer, StreamSupervisor, SupervisorHandle, SupervisorOptions};
use crate::relay::codec::record_codec;
use crate::relay::RelayClient;

const WAIT: Duration = Duration::from_secs(5);

/// Starts a capture supervisor on the test pattern with a relay server in
/// front of it, returning the relay address.
async fn capture_node(cancel: &CancellationToken) -> anyhow::Result<(SupervisorHandle, String)> {
    let source = PatternSource::new(&pattern_config());
    let (capture, handle) = StreamSupervisor::new("capture", source, fast_options());
    tokio::spawn(capture.run(cancel.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = RelayServer::new(listener, handle.clone(), 2);
    let addr = server.local_addr()?.to_string();
    tokio::spawn(server.run(cancel.clone()));
    Ok((handle, addr))
}

fn broadcast_node(addr: &str, cancel: &CancellationToken) -> SupervisorHandle {
    let client = RelayClient::new(addr, Duration::from_secs(1));
    let (broadcast, handle) = StreamSupervisor::new("broadcast", client, fast_options());
    tokio::spawn(broadcast.run(cancel.clone()));
    handle
}

#[tokio::test]
async fn test_frames_reach_broadcast_viewer() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (capture, addr) = capture_node(&cancel).await?;
    let broadcast = broadcast_node(&addr, &cancel);

    // nobody watching: neither side streams
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!capture.is_streaming());
    assert!(!broadcast.is_streaming());

    let (viewer, receiver) = Consumer::new("viewer", 2);
    broadcast.admit(viewer.clone()).await?;
    let (frame, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await?
        .context("viewer cancelled")?;
    assert_eq!(frame.len(), 16);
    assert!(capture.is_streaming());
    assert_eq!(capture.consumer_count(), 1);

    // last viewer leaves: the link closes and the camera stops
    viewer.cancel();
    wait_until(|| !broadcast.is_streaming()).await?;
    wait_until(|| capture.consumer_count() == 0 && !capture.is_streaming()).await?;

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn test_each_broadcast_node_is_a_consumer() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (capture, addr) = capture_node(&cancel).await?;
    let first = broadcast_node(&addr, &cancel);
    let second = broadcast_node(&addr, &cancel);

    let (a, ra) = Consumer::new("a", 2);
    let (b, rb) = Consumer::new("b", 2);
    first.admit(a.clone()).await?;
    second.admit(b.clone()).await?;

    for receiver in [&ra, &rb] {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await?
            .context("viewer cancelled")?;
    }
    assert_eq!(capture.consumer_count(), 2);

    // one node leaving does not disturb the other
    a.cancel();
    wait_until(|| capture.consumer_count() == 1).await?;
    assert!(capture.is_streaming());
    tokio::time::timeout(Duration::from_secs(5), rb.recv())
        .await?
        .context("viewer cancelled")?;

    b.cancel();
    wait_until(|| !capture.is_streaming()).await?;
    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_retries_until_capture_is_up() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // reserve a port, then leave it closed for a while
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let broadcast = broadcast_node(&addr.to_string(), &cancel);
    let (viewer, receiver) = Consumer::new("viewer", 2);
    broadcast.admit(viewer).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!broadcast.is_streaming());

    let source = PatternSource::new(&pattern_config());
    let (capture, handle) = StreamSupervisor::new("capture", source, fast_options());
    tokio::spawn(capture.run(cancel.clone()));
    let server = RelayServer::bind(&addr.to_string(), handle, 2).await?;
    tokio::spawn(server.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await?
        .context("viewer cancelled")?;
    assert!(broadcast.is_streaming());

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn test_broadcast_redials_after_capture_drops_link() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let broadcast = broadcast_node(&listener.local_addr()?.to_string(), &cancel);
    let (viewer, receiver) = Consumer::new("viewer", 2);
    broadcast.admit(viewer).await?;

    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await??;
    let mut capture = FramedWrite::new(socket, record_codec());
    capture.send(Bytes::from_static(b"first")).await?;
    let (frame, _) = tokio::time::timeout(WAIT, receiver.recv())
        .await?
        .context("viewer cancelled")?;
    assert_eq!(frame, Frame::from(&b"first"[..]));
    assert!(broadcast.is_streaming());

    // capture socket dies mid-stream: the broadcast side dials again
    drop(capture);
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept()).await??;
    let mut capture = FramedWrite::new(socket, record_codec());
    capture.send(Bytes::from_static(b"second")).await?;
    let (frame, _) = tokio::time::timeout(WAIT, receiver.recv())
        .await?
        .context("viewer cancelled")?;
    assert_eq!(frame, Frame::from(&b"second"[..]));
    assert!(broadcast.is_streaming());

    cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn test_link_dropped_on_accept_is_redialled_at_poll_rate() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    // accepts every dial and hangs up at once
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dials);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::Relaxed);
            drop(socket);
        }
    });

    let idle_poll = Duration::from_millis(100);
    let options = SupervisorOptions {
        idle_poll,
        frame_timeout: Duration::from_millis(200),
        idle_timeout: None,
    };
    let client = RelayClient::new(addr, Duration::from_secs(1));
    let (broadcast, handle) = StreamSupervisor::new("broadcast", client, options);
    tokio::spawn(broadcast.run(cancel.clone()));
    let (viewer, _receiver) = Consumer::new("viewer", 2);
    handle.admit(viewer).await?;

    let window = Duration::from_secs(1);
    tokio::time::sleep(window).await;
    let dials = dials.load(Ordering::Relaxed);
    let limit = (window.as_millis() / idle_poll.as_millis()) as usize + 1;
    assert!(dials >= 2, "link was not redialled ({} dials)", dials);
    assert!(dials <= limit, "{} dials in {:?}, expected at most {}", dials, window, limit);

    cancel.cancel();
    Ok(())
}
