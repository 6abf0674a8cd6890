//! Integration tests: live update channel against an in-process server.
//!
//! - Upgrade requests carry the identity headers
//! - Malformed frames are dropped without ending the session
//! - Keepalive pings reach the server
//! - A dropped connection empties the slot and is redialled

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aggregator_agent::channel::{ChannelSettings, ConnectionState, LiveUpdateChannel};
use aggregator_agent::DesiredConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn settings() -> ChannelSettings {
    ChannelSettings {
        keepalive_period: Duration::from_millis(100),
        read_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(1),
        dial_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(100),
    }
}

fn channel_for(addr: std::net::SocketAddr) -> (Arc<DesiredConfig>, Arc<LiveUpdateChannel>) {
    let host = addr.to_string();
    let config = common::config(&[("NFG_TFA_CONTROLLER_HOST", host.as_str()), ("SKIP_VERIFY_TLS", "true")]);
    let (desired, _intents) = DesiredConfig::new(&config);
    let desired = Arc::new(desired);
    let channel = Arc::new(LiveUpdateChannel::new(Arc::clone(&desired), settings()));
    (desired, channel)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_updates_applied_and_malformed_frames_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (headers_tx, mut headers_rx) = mpsc::unbounded_channel();
    let pings = Arc::new(AtomicUsize::new(0));

    let server_pings = Arc::clone(&pings);
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let _ = headers_tx.send((
                req.uri().path().to_string(),
                header("x_auth_key"),
                header("x_aggregator_name"),
            ));
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        ws.send(Message::text("{definitely not json")).await.unwrap();
        ws.send(Message::text(
            r#"{"name":"agg-1","syslogEnabled":true,"logstashEnabled":true}"#,
        ))
        .await
        .unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if message.is_ping() {
                server_pings.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let (desired, channel) = channel_for(addr);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.run(shutdown_rx).await }
    });

    let (path, auth, name) = headers_rx.recv().await.unwrap();
    assert_eq!(path, "/sync/ws/updates");
    assert_eq!(auth.as_deref(), Some(common::SECRET));
    assert_eq!(name.as_deref(), Some(common::NAME));

    eventually("update to apply", || {
        let flags = desired.flags();
        flags.syslog_enabled && flags.logstash_enabled
    })
    .await;
    assert!(channel.is_connected());

    eventually("keepalive pings", || pings.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(channel.connection_state(), ConnectionState::Connected);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .unwrap()
        .unwrap();
    assert!(!channel.is_connected());
    assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
    server.abort();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();

    let server_accepted = Arc::clone(&accepted);
    let server = tokio::spawn(async move {
        // First session: accept, then drop the socket without a close frame.
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        server_accepted.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(ws);
        let _ = dropped_tx.send(());

        // Hold off the next handshake so the empty slot is observable.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        server_accepted.fetch_add(1, Ordering::SeqCst);
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (_desired, channel) = channel_for(addr);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.run(shutdown_rx).await }
    });

    eventually("first connection", || channel.is_connected()).await;
    dropped_rx.await.unwrap();

    eventually("slot to empty", || !channel.is_connected()).await;
    eventually("second handshake", || accepted.load(Ordering::SeqCst) == 2).await;
    eventually("reconnection", || channel.is_connected()).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .unwrap()
        .unwrap();
    server.abort();
}

#[tokio::test]
async fn test_dial_failure_is_retried() {
    // Reserve a port, then leave it closed until the channel has failed once.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (_desired, channel) = channel_for(addr);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.run(shutdown_rx).await }
    });

    // Long enough for at least one refused dial and its reconnect delay.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!channel.is_connected());
    assert!(!task.is_finished(), "channel gave up after a failed dial");

    let listener = TcpListener::bind(addr).await.unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    eventually("connection after retry", || channel.is_connected()).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .unwrap()
        .unwrap();
    server.abort();
}
