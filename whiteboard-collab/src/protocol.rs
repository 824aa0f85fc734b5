//! Binary protocol between whiteboard clients and the session server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded frame:
//! ```text
//! client ──► server   ClientFrame { request_id, request }
//! server ──► client   ServerFrame::Reply { request_id, result }
//!                     ServerFrame::Event(ClientEvent)
//! ```
//! Requests on one connection are answered in the order they were sent.
//! Events are pushed at any time, interleaved with replies.

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::action_log::CanvasBlob;
use crate::error::SessionError;
use crate::handle::ClientEvent;

/// Largest frame accepted on either side of the socket.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Operations a client can ask the server to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Must be the first request on a connection
    Register { is_admin: bool, username: String },
    Unregister,
    BroadcastAction(Action),
    BroadcastMessage(String),
    AcceptUserJoin(String),
    RefuseUserJoin(String),
    KickUser { target: String, reason: String },
    /// `is_close` also blocks drawing until a new canvas is opened
    ClearCanvas { is_close: bool },
    ImportCanvas(CanvasBlob),
    ExportCanvas,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister => "unregister",
            Self::BroadcastAction(_) => "broadcast_action",
            Self::BroadcastMessage(_) => "broadcast_message",
            Self::AcceptUserJoin(_) => "accept_user_join",
            Self::RefuseUserJoin(_) => "refuse_user_join",
            Self::KickUser { .. } => "kick_user",
            Self::ClearCanvas { .. } => "clear_canvas",
            Self::ImportCanvas(_) => "import_canvas",
            Self::ExportCanvas => "export_canvas",
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    Done,
    /// Server-assigned id of the accepted action
    ActionAccepted(u64),
    /// Number of actions loaded by an import
    Imported(usize),
    Canvas(CanvasBlob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub request_id: u64,
    pub request: Request,
}

impl ClientFrame {
    pub fn new(request_id: u64, request: Request) -> Self {
        Self {
            request_id,
            request,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Reply {
        request_id: u64,
        result: Result<ReplyBody, SessionError>,
    },
    Event(ClientEvent),
}

impl ServerFrame {
    pub fn reply(request_id: u64, result: Result<ReplyBody, SessionError>) -> Self {
        Self::Reply { request_id, result }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    // The limit makes declared lengths fail before anything is allocated for them.
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A reply arrived for a request id nobody is waiting on
    UnexpectedReply(u64),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedReply(id) => write!(f, "Unexpected reply for request {id}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
