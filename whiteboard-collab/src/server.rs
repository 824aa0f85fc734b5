//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── SessionRegistry (admin, members, waiting)
//!            ├── connection task ──► SessionCoordinator
//! Client B ──┘    (one per socket)     ├── ActionLog ── CanvasBlob (LZ4)
//!      ▲                               └── BroadcastEngine
//!      │                                        │
//!      └────────── per-client event channel ◄───┘
//! ```
//!
//! Each connection task reads request frames and answers them in arrival
//! order, while forwarding the events queued on its client channel. When
//! the server drops a client (kick, refusal, admin departure, shutdown)
//! its channel closes and the task closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastConfig;
use crate::coordinator::SessionCoordinator;
use crate::error::SessionError;
use crate::handle::{ClientEvent, ClientHandle};
use crate::protocol::{ClientFrame, ReplyBody, Request, ServerFrame, MAX_FRAME_BYTES};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events buffered per client before deliveries start waiting
    pub client_queue_capacity: usize,
    /// Upper bound on a single delivery to one client, in milliseconds
    pub delivery_timeout_ms: u64,
    /// Consecutive failed deliveries before a client is dropped (0 = never)
    pub max_consecutive_failures: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            client_queue_capacity: 256,
            delivery_timeout_ms: 5_000,
            max_consecutive_failures: 3,
        }
    }
}

impl ServerConfig {
    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub total_bytes: u64,
}

/// Identity a connection acquired through a successful `Register`.
#[derive(Debug, Clone)]
struct Session {
    username: String,
    connection_id: Uuid,
}

pub struct SessionServer {
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SessionServer {
    /// Create a server. Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let coordinator = Arc::new(SessionCoordinator::new(config.broadcast_config()));
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Whiteboard server listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let reaper = self.coordinator.spawn_eviction_reaper();
        if reaper.is_none() {
            log::debug!("Eviction reaper already running");
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Notify every client and drop them all.
    pub async fn shutdown(&self, reason: &str) {
        log::info!("Shutting down: {reason}");
        self.coordinator.shutdown(reason).await;
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<SessionCoordinator>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(MAX_FRAME_BYTES))
            .max_frame_size(Some(MAX_FRAME_BYTES));
        let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut events_rx: Option<mpsc::Receiver<Arc<ClientEvent>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let frame = match ClientFrame::decode(&bytes) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let result = Self::dispatch(
                                    &coordinator,
                                    &config,
                                    &mut session,
                                    &mut events_rx,
                                    frame.request,
                                )
                                .await;

                                {
                                    let mut s = stats.write().await;
                                    s.total_requests += 1;
                                    s.total_bytes += bytes.len() as u64;
                                    if result.is_err() {
                                        s.rejected_requests += 1;
                                    }
                                }

                                let reply = ServerFrame::reply(frame.request_id, result).encode()?;
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = async {
                        match events_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not registered yet: nothing to forward
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Some(event) => {
                                log::trace!("Forwarding {event:?} to {addr}");
                                let frame = ServerFrame::Event((*event).clone()).encode()?;
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            None => {
                                // Dropped by the server; every queued event has been sent.
                                log::info!("Session ended for {addr}, closing connection");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(session) = session {
            coordinator
                .disconnect(&session.username, session.connection_id)
                .await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        result
    }

    /// Run one request on behalf of a connection.
    async fn dispatch(
        coordinator: &SessionCoordinator,
        config: &ServerConfig,
        session: &mut Option<Session>,
        events_rx: &mut Option<mpsc::Receiver<Arc<ClientEvent>>>,
        request: Request,
    ) -> Result<ReplyBody, SessionError> {
        log::debug!("Request {}", request.name());

        if let Request::Register { is_admin, username } = &request {
            if let Some(current) = session.as_ref() {
                return Err(SessionError::AlreadyRegistered(current.username.clone()));
            }
            let (handle, rx) =
                ClientHandle::channel(username.clone(), *is_admin, config.client_queue_capacity);
            let connection_id = handle.id();
            coordinator.register_client(handle).await?;
            *session = Some(Session {
                username: username.clone(),
                connection_id,
            });
            *events_rx = Some(rx);
            return Ok(ReplyBody::Done);
        }

        let Some(username) = session.as_ref().map(|s| s.username.clone()) else {
            return Err(SessionError::NotRegistered("<unregistered connection>".into()));
        };

        match request {
            Request::Register { .. } => Ok(ReplyBody::Done),
            Request::Unregister => {
                coordinator.unregister_client(&username).await?;
                *session = None;
                Ok(ReplyBody::Done)
            }
            Request::BroadcastAction(action) => coordinator
                .broadcast_action(&username, action)
                .await
                .map(ReplyBody::ActionAccepted),
            Request::BroadcastMessage(text) => {
                coordinator.broadcast_message(&username, &text).await?;
                Ok(ReplyBody::Done)
            }
            Request::AcceptUserJoin(user) => {
                coordinator.accept_user_join(&username, &user).await?;
                Ok(ReplyBody::Done)
            }
            Request::RefuseUserJoin(user) => {
                coordinator.refuse_user_join(&username, &user).await?;
                Ok(ReplyBody::Done)
            }
            Request::KickUser { target, reason } => {
                coordinator.kick_user(&username, &target, &reason).await?;
                Ok(ReplyBody::Done)
            }
            Request::ClearCanvas { is_close } => {
                coordinator.clear_canvas(&username, is_close).await?;
                Ok(ReplyBody::Done)
            }
            Request::ImportCanvas(blob) => coordinator
                .import_canvas(&username, blob)
                .await
                .map(ReplyBody::Imported),
            Request::ExportCanvas => coordinator
                .export_canvas(&username)
                .await
                .map(ReplyBody::Canvas),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }
}
