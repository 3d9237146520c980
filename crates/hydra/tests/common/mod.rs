//! Common helpers for integration tests: an in-process mock hydra node.

#![allow(dead_code)]

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hydra::HydraEvent;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

pub const HASH: &str = "f0a39560ea80ccc68e8dffb6a4a077c8927811f06c5d9058d0fa2d1a8d047d20";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hydra=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

enum Action {
    Frame(String),
    Close,
    Drop,
}

/// Scripted hydra node: serves one WebSocket client at a time, pushes frames on
/// request and records every command it receives.
pub struct MockNode {
    /// HTTP-style base URL; the client derives the ws:// endpoint from it.
    pub url: String,
    actions: mpsc::UnboundedSender<Action>,
    commands: mpsc::UnboundedReceiver<Value>,
    uris: Arc<Mutex<Vec<String>>>,
    close_frames: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockNode {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind mock node")?;
        let port = listener.local_addr()?.port();
        let (actions, mut action_rx) = mpsc::unbounded_channel::<Action>();
        let (command_tx, commands) = mpsc::unbounded_channel::<Value>();
        let uris = Arc::new(Mutex::new(Vec::new()));
        let seen_uris = Arc::clone(&uris);
        let close_frames = Arc::new(AtomicUsize::new(0));
        let seen_closes = Arc::clone(&close_frames);

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let record = Arc::clone(&seen_uris);
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    record.lock().unwrap().push(req.uri().to_string());
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        action = action_rx.recv() => match action {
                            Some(Action::Frame(text)) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Action::Close) => {
                                let _ = sink.send(Message::Close(None)).await;
                            }
                            Some(Action::Drop) => break,
                            None => return,
                        },
                        msg = source.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(v) = serde_json::from_str(&text) {
                                    let _ = command_tx.send(v);
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                seen_closes.fetch_add(1, Ordering::SeqCst);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => break,
                        },
                    }
                }
            }
        });

        Ok(Self {
            url: format!("http://127.0.0.1:{}", port),
            actions,
            commands,
            uris,
            close_frames,
            task,
        })
    }

    /// Push a raw text frame to the connected client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.actions.send(Action::Frame(frame.into()));
    }

    /// Start a close handshake from the node side.
    pub fn close(&self) {
        let _ = self.actions.send(Action::Close);
    }

    /// Drop the TCP connection without a close frame.
    pub fn drop_connection(&self) {
        let _ = self.actions.send(Action::Drop);
    }

    /// Next command the client sent.
    pub async fn next_command(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("command within 5s")
            .expect("mock node alive")
    }

    /// Close frames received from the client.
    pub fn close_frames(&self) -> usize {
        self.close_frames.load(Ordering::SeqCst)
    }

    /// Request URIs of every accepted WebSocket handshake.
    pub fn handshake_uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait for the next event with `tag`, skipping others.
pub async fn wait_for(events: &mut broadcast::Receiver<HydraEvent>, tag: &str) -> HydraEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ev) if ev.tag() == tag => return ev,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event within 5s", tag))
}

pub fn head_is_open(head_id: &str) -> String {
    format!(
        r#"{{"tag":"HeadIsOpen","headId":"{}","utxo":{{"{}#0":{{"address":"addr_test1","value":{{"lovelace":1000000}}}}}},"seq":3,"timestamp":"2024-01-01T00:00:00Z"}}"#,
        head_id, HASH
    )
}
