//! WebSocket client for the whiteboard session server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - One typed method per server operation, each awaiting its reply
//! - A stream of server-pushed events for the application
//!
//! Requests are matched to replies by request id, so several tasks may
//! share one client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::action::Action;
use crate::action_log::CanvasBlob;
use crate::error::SessionError;
use crate::handle::ClientEvent;
use crate::protocol::{ClientFrame, ProtocolError, ReplyBody, Request, ServerFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum WhiteboardEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed by the server
    Disconnected,
    /// Event pushed by the server
    Server(ClientEvent),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server rejected the request
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(ReplyBody),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<ReplyBody, SessionError>>>>>;

pub struct WhiteboardClient {
    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Requests waiting for a reply, by request id
    pending: PendingReplies,

    next_request_id: AtomicU64,

    /// How long a request waits for its reply
    request_timeout: Duration,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::UnboundedReceiver<WhiteboardEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::UnboundedSender<WhiteboardEvent>,
}

impl WhiteboardClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            request_timeout: Duration::from_secs(10),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<WhiteboardEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(WhiteboardEvent::Connected);

        // Reader task: route replies to their callers, events to the application
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(ServerFrame::Reply { request_id, result }) => {
                                match pending.lock().await.remove(&request_id) {
                                    Some(reply_tx) => {
                                        let _ = reply_tx.send(result);
                                    }
                                    None => log::warn!(
                                        "{}",
                                        ProtocolError::UnexpectedReply(request_id)
                                    ),
                                }
                            }
                            Ok(ServerFrame::Event(event)) => {
                                let _ = event_tx.send(WhiteboardEvent::Server(event));
                            }
                            Err(e) => log::warn!("Failed to decode server frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every request still waiting
            *state.write().await = ConnectionState::Disconnected;
            pending.lock().await.clear();
            let _ = event_tx.send(WhiteboardEvent::Disconnected);
        });

        Ok(())
    }

    /// Close the connection. The server treats this like an unregister.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<ReplyBody, ClientError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let encoded = ClientFrame::new(request_id, request).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if tx.send(encoded).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    async fn request_done(&self, request: Request) -> Result<(), ClientError> {
        match self.request(request).await? {
            ReplyBody::Done => Ok(()),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Register as admin (creating the whiteboard) or ask to join it.
    pub async fn register(&self, username: impl Into<String>, is_admin: bool) -> Result<(), ClientError> {
        self.request_done(Request::Register {
            is_admin,
            username: username.into(),
        })
        .await
    }

    pub async fn unregister(&self) -> Result<(), ClientError> {
        self.request_done(Request::Unregister).await
    }

    /// Send a drawing action. Returns the id the server assigned to it.
    pub async fn send_action(&self, action: Action) -> Result<u64, ClientError> {
        match self.request(Request::BroadcastAction(action)).await? {
            ReplyBody::ActionAccepted(id) => Ok(id),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.request_done(Request::BroadcastMessage(text.into())).await
    }

    pub async fn accept_user_join(&self, username: impl Into<String>) -> Result<(), ClientError> {
        self.request_done(Request::AcceptUserJoin(username.into())).await
    }

    pub async fn refuse_user_join(&self, username: impl Into<String>) -> Result<(), ClientError> {
        self.request_done(Request::RefuseUserJoin(username.into())).await
    }

    pub async fn kick_user(
        &self,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.request_done(Request::KickUser {
            target: target.into(),
            reason: reason.into(),
        })
        .await
    }

    pub async fn clear_canvas(&self, is_close: bool) -> Result<(), ClientError> {
        self.request_done(Request::ClearCanvas { is_close }).await
    }

    /// Replace the shared canvas. Returns the number of imported actions.
    pub async fn import_canvas(&self, blob: CanvasBlob) -> Result<usize, ClientError> {
        match self.request(Request::ImportCanvas(blob)).await? {
            ReplyBody::Imported(count) => Ok(count),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    pub async fn export_canvas(&self) -> Result<CanvasBlob, ClientError> {
        match self.request(Request::ExportCanvas).await? {
            ReplyBody::Canvas(blob) => Ok(blob),
            other => Err(ClientError::UnexpectedReply(other)),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
