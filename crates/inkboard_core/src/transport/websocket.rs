//! WebSocket provider (y-websocket relay compatible).
//!
//! Connects to `{collab_url}/{room}` and exchanges binary Y-sync frames.
//! The socket runs on a private tokio runtime; inbound frames and status
//! changes are queued for the session to drain on its own thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Provider, ProviderEvent, Transport};
use crate::error::{CollabError, Result};

type EventQueue = Arc<Mutex<VecDeque<ProviderEvent>>>;

/// Allocates [`WebSocketProvider`]s against one relay, sharing a runtime.
pub struct WebSocketTransport {
    server_url: String,
    runtime: Arc<Runtime>,
}

impl WebSocketTransport {
    /// Create a transport for the relay at `server_url` (e.g. "ws://localhost:1234").
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("inkboard-ws")
            .enable_all()
            .build()
            .map_err(|e| CollabError::Transport(format!("Failed to create runtime: {}", e)))?;
        Ok(Self {
            server_url: server_url.into(),
            runtime: Arc::new(runtime),
        })
    }
}

impl Transport for WebSocketTransport {
    fn provider(&self, room: &str) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(WebSocketProvider::new(
            &self.server_url,
            room,
            Arc::clone(&self.runtime),
        )?))
    }
}

/// WebSocket-based provider for a single room.
pub struct WebSocketProvider {
    url: url::Url,
    room: String,
    runtime: Arc<Runtime>,
    connected: Arc<AtomicBool>,
    events: EventQueue,
    /// Sender for outgoing frames while a connection task is running
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketProvider {
    /// Create a provider for `room` on the relay at `server_url`.
    pub fn new(server_url: &str, room: &str, runtime: Arc<Runtime>) -> Result<Self> {
        let base = server_url.trim_end_matches('/');
        let url = url::Url::parse(&format!("{}/{}", base, room))
            .map_err(|e| CollabError::Transport(format!("Invalid relay URL '{}': {}", base, e)))?;
        Ok(Self {
            url,
            room: room.to_string(),
            runtime,
            connected: Arc::new(AtomicBool::new(false)),
            events: Arc::new(Mutex::new(VecDeque::new())),
            tx: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Background task owning the socket.
    async fn connection_task(
        url: url::Url,
        connected: Arc<AtomicBool>,
        events: EventQueue,
        mut rx_send: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let push = |event: ProviderEvent| events.lock().unwrap().push_back(event);

        let ws_stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::error!("[WebSocket] Connection to {} failed: {}", url, e);
                push(ProviderEvent::ConnectionError(e.to_string()));
                return;
            }
        };

        log::info!("[WebSocket] Connected to {}", url);
        connected.store(true, Ordering::SeqCst);
        push(ProviderEvent::Connected);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                outgoing = rx_send.recv() => {
                    let Some(frame) = outgoing else {
                        // Sender dropped: disconnect requested
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    };
                    if let Err(e) = write.send(Message::Binary(frame.into())).await {
                        log::error!("[WebSocket] Send error: {}", e);
                        push(ProviderEvent::ConnectionError(e.to_string()));
                        break;
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => push(ProviderEvent::Message(data.to_vec())),
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("[WebSocket] Connection closed by server");
                            push(ProviderEvent::ConnectionError("connection closed by server".into()));
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ignore text, ping and pong frames
                        }
                        Some(Err(e)) => {
                            log::error!("[WebSocket] Read error: {}", e);
                            push(ProviderEvent::ConnectionError(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        log::info!("[WebSocket] Connection task for {} finished", url);
    }
}

impl Provider for WebSocketProvider {
    fn room(&self) -> &str {
        &self.room
    }

    fn connect(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap() = Some(tx_send);

        *task = Some(self.runtime.spawn(Self::connection_task(
            self.url.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.events),
            rx_send,
        )));
        Ok(())
    }

    fn disconnect(&self) {
        // Dropping the sender makes the task close the socket.
        self.tx.lock().unwrap().take();
        self.task.lock().unwrap().take();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.events
                .lock()
                .unwrap()
                .push_back(ProviderEvent::Disconnected);
        }
        log::info!("[WebSocket] Disconnected from {}", self.url);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, message: Vec<u8>) -> Result<()> {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) if self.is_connected() => tx
                .send(message)
                .map_err(|_| CollabError::Transport("connection task stopped".into())),
            _ => Err(CollabError::NotConnected(self.room.clone())),
        }
    }

    fn drain_events(&self) -> Vec<ProviderEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }
}

impl Drop for WebSocketProvider {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url() {
        let transport = WebSocketTransport::new("ws://localhost:1234/").unwrap();
        let provider = WebSocketProvider::new(
            &transport.server_url,
            "abc",
            Arc::clone(&transport.runtime),
        )
        .unwrap();
        assert_eq!(provider.url.as_str(), "ws://localhost:1234/abc");
        assert!(!provider.is_connected());
        assert!(matches!(
            provider.send(vec![0]),
            Err(CollabError::NotConnected(_))
        ));
    }

    #[test]
    fn test_invalid_url_is_transport_error() {
        let transport = WebSocketTransport::new("not a url").unwrap();
        assert!(matches!(
            transport.provider("abc"),
            Err(CollabError::Transport(_))
        ));
    }
}
