//! Scripted WebSocket server for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;

/// Token the tests authenticate with.
pub const TEST_TOKEN: &str = "test-token";

/// What the server does with one accepted connection.
#[derive(Debug, Clone)]
pub enum Script {
    /// Send the frames, then drop the socket without a close handshake.
    SendThenDrop(Vec<String>),
    /// Send the frames, then keep reading until the client goes away.
    SendThenHold(Vec<String>),
    /// Record `n` text messages, then drop the socket.
    ReceiveThenDrop(usize),
    /// Hold the TCP connection for a while before the handshake, then
    /// run the inner script.
    Delayed(Duration, Box<Script>),
}

/// Running test server.
pub struct TestServer {
    /// `ws://` URL of the server.
    pub url: String,
    scripts: Arc<Mutex<VecDeque<Script>>>,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<(usize, String)>>>,
    protocols: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// Bind on an ephemeral port. Connections beyond the scripts hold.
    pub async fn start(scripts: Vec<Script>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/stream", listener.local_addr().unwrap());

        let server = Self {
            url,
            scripts: Arc::new(Mutex::new(scripts.into())),
            connections: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            protocols: Arc::new(Mutex::new(Vec::new())),
        };

        let scripts = Arc::clone(&server.scripts);
        let connections = Arc::clone(&server.connections);
        let received = Arc::clone(&server.received);
        let protocols = Arc::clone(&server.protocols);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = connections.fetch_add(1, Ordering::SeqCst);
                let script = scripts
                    .lock()
                    .pop_front()
                    .unwrap_or(Script::SendThenHold(Vec::new()));
                let received = Arc::clone(&received);
                let protocols = Arc::clone(&protocols);
                let (delay, script) = match script {
                    Script::Delayed(delay, inner) => (Some(delay), *inner),
                    other => (None, other),
                };
                tokio::spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    serve(stream, index, script, received, protocols).await;
                });
            }
        });

        server
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Text messages received on connection `index`, in order.
    pub fn received_on(&self, index: usize) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Subprotocol header of every handshake.
    pub fn protocols(&self) -> Vec<String> {
        self.protocols.lock().clone()
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    index: usize,
    script: Script,
    received: Arc<Mutex<Vec<(usize, String)>>>,
    protocols: Arc<Mutex<Vec<String>>>,
) {
    // The client offers its token as subprotocol and expects it echoed
    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            protocols
                .lock()
                .push(protocol.to_str().unwrap_or_default().to_string());
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    let (frames, hold) = match script {
        Script::SendThenDrop(frames) => (frames, false),
        Script::SendThenHold(frames) => (frames, true),
        Script::Delayed(_, _) => return,
        Script::ReceiveThenDrop(n) => {
            let mut seen = 0;
            while seen < n {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        received.lock().push((index, text.to_string()));
                        seen += 1;
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                }
            }
            return;
        }
    };
    for frame in frames {
        if write.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
    if !hold {
        return;
    }

    while let Some(Ok(message)) = read.next().await {
        match message {
            Message::Text(text) => received.lock().push((index, text.to_string())),
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Trade frame for `ticker` carrying a sequence number.
pub fn trade(ticker: &str, seq: usize) -> String {
    format!(r#"{{"ev":"trade","symb":"{ticker}","seq":{seq}}}"#)
}
