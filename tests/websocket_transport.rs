//! WebSocket transport against a loopback server

use std::sync::Arc;
use std::time::Duration;

use firehose::config::{PipelineConfig, SinkKind};
use firehose::sink::MemoryLog;
use firehose::transports::WebSocketConnector;
use firehose::{Connection, Connector, IngestError, Pipeline};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/subscribe", listener.local_addr().unwrap());
    (listener, url)
}

fn event(rev: usize) -> String {
    format!(r#"{{"kind":"commit","commit":{{"rev":"rev{}"}}}}"#, rev)
}

#[tokio::test]
async fn receives_frames_until_server_closes() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Text("first".to_string())).await.unwrap();
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let mut connection = WebSocketConnector::new(url).connect().await.unwrap();

    assert_eq!(connection.receive().await.unwrap().unwrap().as_bytes(), b"first");
    assert_eq!(connection.receive().await.unwrap().unwrap().as_bytes(), &[1, 2, 3]);

    let err = connection.receive().await.unwrap_err();
    assert!(matches!(err, IngestError::ConnectionClosed { .. }), "unexpected error: {}", err);
    server.await.unwrap();
}

#[tokio::test]
async fn answers_server_pings() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Ping(b"are you there".to_vec())).await.unwrap();

        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Pong(payload) => {
                    assert_eq!(payload, b"are you there".to_vec());
                    break;
                }
                other => panic!("expected pong, got {:?}", other),
            }
        }

        ws.send(Message::Text("after pong".to_string())).await.unwrap();
        // Keep the socket open until the client has read the frame
        let _ = ws.next().await;
    });

    let mut connection = WebSocketConnector::new(url).connect().await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), connection.receive()).await.unwrap().unwrap();
    assert_eq!(frame.unwrap().as_bytes(), b"after pong");

    connection.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn silent_peer_trips_the_ping_timeout() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let _ws = accept_async(tcp).await.unwrap();
        // Never read, so pings are never answered
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let connector = WebSocketConnector::new(url)
        .ping_interval(Duration::from_millis(50))
        .ping_timeout(Duration::from_millis(150));
    let mut connection = connector.connect().await.unwrap();

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(3), connection.receive())
        .await
        .expect("ping timeout should fire")
        .unwrap_err();

    assert!(matches!(err, IngestError::ConnectionClosed { .. }));
    assert!(started.elapsed() >= Duration::from_millis(150));
    server.abort();
}

#[tokio::test]
async fn pipeline_reconnects_to_a_restarting_server() {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        // First session ends abruptly after a burst
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        for i in 0..20 {
            ws.send(Message::Text(event(i))).await.unwrap();
        }
        ws.close(None).await.unwrap();
        drop(ws);

        // Second session stays up
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        for i in 20..30 {
            ws.send(Message::Text(event(i))).await.unwrap();
        }
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let config = PipelineConfig {
        upstream_url: url.clone(),
        sink: SinkKind::Memory,
        queue_capacity: 100,
        workers: 2,
        dequeue_timeout_ms: 20,
        reconnect_backoff_secs: 0.05,
        ..Default::default()
    };
    let log = Arc::new(MemoryLog::new("events", 3));
    let pipeline = Pipeline::spawn(&config, WebSocketConnector::new(url), log.clone()).unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        while pipeline.counters().processed < 30 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "only {} events processed", pipeline.counters().processed);

    let summary = pipeline.shutdown().await.unwrap();
    assert_eq!(summary.totals.reconnects, 1);
    assert_eq!(summary.totals.processed, 30);
    assert_eq!(log.len(), 30);

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
