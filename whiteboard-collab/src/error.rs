//! Session-level errors.
//!
//! These are returned synchronously to the caller of a coordinator
//! operation and travel back over the wire inside a reply frame, so the
//! client sees the same variant the server produced.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SessionError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("user '{0}' is not in this whiteboard")]
    NotRegistered(String),

    #[error("user '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("only one admin can be registered at a time ('{0}' is admin)")]
    AlreadyHasAdmin(String),

    #[error("no admin registered yet, please register as admin first")]
    NoAdminYet,

    #[error("no pending join request from '{0}'")]
    UnknownWaitingUser(String),

    #[error("admin cannot kick themselves")]
    SelfKick,

    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    #[error("corrupt canvas data: {0}")]
    CorruptData(String),

    /// Per-recipient broadcast failure. Recorded by the broadcast engine,
    /// never returned to the sender of the broadcast.
    #[error("delivery to '{recipient}' failed: {reason}")]
    DeliveryFailure { recipient: String, reason: String },
}

pub type SessionResult<T> = Result<T, SessionError>;
