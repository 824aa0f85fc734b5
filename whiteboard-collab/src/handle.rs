//! Per-client outbound channel.
//!
//! A [`ClientHandle`] is the server's only way to reach a client. It wraps
//! the sending half of a bounded channel; the transport owns the receiving
//! half and writes each [`ClientEvent`] to the socket. Dropping every clone
//! of the handle closes the channel, which the transport treats as the end
//! of the session for that client.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use uuid::Uuid;

use crate::action::Action;
use crate::action_log::CanvasBlob;
use crate::error::SessionError;

/// Callback surface invoked by the server on a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Sent once after registration succeeds
    InitialClientState { usernames: Vec<String>, is_admin: bool },
    AddUser(String),
    RemoveUser(String),
    Action(Action),
    Message { sender: String, text: String },
    /// Admin-only prompt: a user is waiting for approval
    AskUserJoin(String),
    Kicked { reason: String },
    ServerShutdown { reason: String },
    /// Replace the whole canvas with the blob's content
    SyncWhiteboard(CanvasBlob),
    /// Block (`true`) or unblock drawing on the client
    CanvasBlocked(bool),
}

/// Server-side handle to one connected client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: Uuid,
    username: String,
    is_admin: bool,
    tx: mpsc::Sender<Arc<ClientEvent>>,
    retired: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Create a handle and the receiver the transport reads from.
    ///
    /// `capacity` bounds how many events may be buffered for this client
    /// before deliveries start waiting.
    pub fn channel(
        username: impl Into<String>,
        is_admin: bool,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<ClientEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: Uuid::new_v4(),
            username: username.into(),
            is_admin,
            tx,
            retired: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Connection id; distinguishes two sessions of the same username.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether this handle was created by an admin registration request.
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Deliver one event, waiting at most `timeout` for buffer space.
    pub async fn deliver(
        &self,
        event: Arc<ClientEvent>,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        self.tx.send_timeout(event, timeout).await.map_err(|e| {
            let reason = match e {
                SendTimeoutError::Timeout(_) => format!("timed out after {timeout:?}"),
                SendTimeoutError::Closed(_) => "channel closed".to_string(),
            };
            SessionError::DeliveryFailure {
                recipient: self.username.clone(),
                reason,
            }
        })
    }
}
