//! Stream Session Tests
//!
//! Runs the streaming collector against a local websocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_common::{DataSource, InstrumentSnapshot};
use market_ingest::collector::{StreamState, StreamingCollector, StreamingConfig};
use market_ingest::storage::{InMemoryMarketStore, MarketStore};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn config(url: String) -> StreamingConfig {
    StreamingConfig {
        url,
        api_key: "key".to_string(),
        api_secret: "secret".to_string(),
        symbols: vec!["AAPL".to_string()],
        reconnect_delay: Duration::from_millis(50),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Server greets, reads the auth request, then drops the connection
#[tokio::test]
async fn test_collector_reconnects_after_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let received = Arc::new(Mutex::new(Vec::<String>::new()));

    let server_received = received.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let Ok(mut ws) = accept_async(tcp).await else {
                continue;
            };
            let _ = ws
                .send(Message::Text(r#"[{"T":"success","msg":"connected"}]"#.to_string()))
                .await;
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                server_received.lock().push(text);
            }
            let _ = ws.close(None).await;
        }
    });

    let store = Arc::new(InMemoryMarketStore::new());
    let collector = Arc::new(StreamingCollector::new(store, config(url)));
    let seen = Arc::new(Mutex::new(Vec::<StreamState>::new()));
    let mut states = collector.subscribe_state();
    let recorder = seen.clone();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            recorder.lock().push(state);
        }
    });
    collector.start();

    wait_until(|| collector.stats().reconnects >= 2).await;

    // Reached authentication on each attempt
    let requests = received.lock().clone();
    assert!(requests.len() >= 2);
    assert!(requests.iter().all(|r| r.contains(r#""action":"auth""#)));
    assert!(requests[0].contains(r#""key":"key""#));

    // Disconnected is always followed by a fresh connection attempt
    let seen = seen.lock().clone();
    let reconnect = seen
        .windows(2)
        .any(|w| w[0] == StreamState::Disconnected && w[1] == StreamState::Connecting);
    assert!(reconnect, "states: {seen:?}");

    collector.stop().await;
    assert_eq!(collector.state(), StreamState::Disconnected);
    assert!(!collector.is_running());
}

/// Full handshake followed by a trade that lands in the store
#[tokio::test]
async fn test_collector_streams_trades_after_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(tcp).await else {
            return;
        };

        let _ = ws
            .send(Message::Text(r#"[{"T":"success","msg":"connected"}]"#.to_string()))
            .await;
        // auth
        let _ = ws.next().await;
        let _ = ws
            .send(Message::Text(r#"[{"T":"success","msg":"authenticated"}]"#.to_string()))
            .await;
        // trade and bar subscriptions
        let _ = ws.next().await;
        let _ = ws.next().await;
        let _ = ws
            .send(Message::Text(
                r#"[{"T":"subscription","trades":["AAPL"],"bars":["AAPL"]}]"#.to_string(),
            ))
            .await;
        let _ = ws
            .send(Message::Text(
                r#"[{"T":"t","S":"AAPL","p":187.25,"s":3,"t":"2025-03-03T14:30:00Z"}]"#.to_string(),
            ))
            .await;

        // Hold the connection open until the client leaves
        while let Some(Ok(message)) = ws.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let store = Arc::new(InMemoryMarketStore::new());
    store
        .upsert_instrument(&InstrumentSnapshot::new("AAPL"))
        .await
        .unwrap();

    let collector = Arc::new(StreamingCollector::new(store.clone(), config(url)));
    collector.start();

    wait_until(|| !store.price_points("AAPL").is_empty()).await;
    assert_eq!(collector.state(), StreamState::Streaming);

    let points = store.price_points("AAPL");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].source, DataSource::Streaming);
    assert_eq!(points[0].volume, 3);
    assert_eq!(collector.stats().reconnects, 0);

    collector.stop().await;
    assert_eq!(collector.state(), StreamState::Disconnected);
}
