//! Isolated feed running the real worker binary against a local server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Script, TEST_TOKEN, TestServer, eventually, trade};
use dataservices_stream::infrastructure::isolation::WorkerSettings;
use dataservices_stream::{
    CloseInfo, Command, Credentials, FeedConfig, Hooks, MarketDataFeed, StreamError,
};
use parking_lot::Mutex;

fn worker_settings(url: String) -> WorkerSettings {
    WorkerSettings {
        url,
        credentials: Credentials::Token(TEST_TOKEN.to_string()),
        auth_url: "http://127.0.0.1:1".to_string(),
        http_timeout: Duration::from_secs(5),
        ssl: true,
        reconnect: true,
        max_reconnect_attempts: 5,
    }
}

fn feed_config(settings: WorkerSettings) -> FeedConfig {
    FeedConfig::new(settings)
        .unwrap()
        .with_worker_path(env!("CARGO_BIN_EXE_dataservices-feed-worker"))
}

#[tokio::test]
async fn isolated_feed_delivers_frames_in_order() {
    let frames = (0..100).map(|seq| trade("PETR4", seq)).collect();
    let server = TestServer::start(vec![Script::SendThenHold(frames)]).await;

    let opens = Arc::new(AtomicUsize::new(0));
    let seqs = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(Vec::<CloseInfo>::new()));
    let hooks = {
        let opens = Arc::clone(&opens);
        let seqs = Arc::clone(&seqs);
        let closes = Arc::clone(&closes);
        Hooks::new()
            .on_open(move |commands| {
                opens.fetch_add(1, Ordering::SeqCst);
                commands.subscribe(["PETR4"]).unwrap();
            })
            .on_message(move |frame| {
                if let Some(seq) = frame.value()["seq"].as_u64() {
                    seqs.lock().push(seq);
                }
                Ok(())
            })
            .on_close(move |c| closes.lock().push(c.clone()))
    };

    let feed = MarketDataFeed::new(feed_config(worker_settings(server.url.clone())), Arc::new(hooks));
    feed.run().await.unwrap();
    assert!(feed.is_running());

    eventually("every frame", || seqs.lock().len() == 100).await;
    assert_eq!(*seqs.lock(), (0..100).collect::<Vec<u64>>());
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    // The open hook's subscription crossed the process boundary
    eventually("subscribe forwarded", || !server.received_on(0).is_empty()).await;
    assert_eq!(
        server.received_on(0),
        vec![Command::subscribe(["PETR4"]).to_json().unwrap()]
    );
    assert_eq!(server.protocols(), vec![TEST_TOKEN.to_string()]);

    feed.close().await;
    assert!(!feed.is_running());
    feed.close().await;
    tokio::time::timeout(Duration::from_secs(1), feed.wait())
        .await
        .expect("closed feed should be finished");

    // Killing the worker is not reported as a disconnect
    assert!(closes.lock().is_empty());
}

#[tokio::test]
async fn worker_failure_surfaces_as_terminal_close() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}/stream", listener.local_addr().unwrap());
    drop(listener);

    let mut settings = worker_settings(url);
    settings.reconnect = false;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(Vec::<CloseInfo>::new()));
    let hooks = {
        let errors = Arc::clone(&errors);
        let closes = Arc::clone(&closes);
        Hooks::new()
            .on_error(move |e: &StreamError| errors.lock().push(e.to_string()))
            .on_close(move |c| closes.lock().push(c.clone()))
    };

    let feed = MarketDataFeed::new(feed_config(settings), Arc::new(hooks));
    feed.run().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), feed.wait())
        .await
        .expect("terminal close should finish the feed");

    let errors = errors.lock().clone();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|e| e.starts_with("worker error")));

    let closes = closes.lock().clone();
    assert_eq!(closes.len(), 1);
    assert!(closes[0].is_terminal());

    feed.close().await;
    assert!(!feed.is_running());
}

#[tokio::test]
async fn second_run_is_rejected() {
    let server = TestServer::start(vec![]).await;
    let feed = MarketDataFeed::new(
        feed_config(worker_settings(server.url.clone())),
        Arc::new(Hooks::new()),
    );
    feed.run().await.unwrap();

    let err = feed.run().await.unwrap_err();
    assert!(matches!(err, dataservices_stream::FeedError::AlreadyStarted));

    feed.close().await;
}
