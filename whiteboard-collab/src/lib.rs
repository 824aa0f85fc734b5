//! # whiteboard-collab: shared whiteboard sessions
//!
//! One admin opens a whiteboard; other users ask to join and wait for the
//! admin's approval. Every accepted drawing action is appended to an
//! in-memory log and relayed to the other members in a single global order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌──────────────────┐
//! │ WhiteboardClient │ ◄──────────────► │ SessionServer    │
//! │ (per user)       │   Binary Proto   │ (one per process)│
//! └──────────────────┘                  └────────┬─────────┘
//!                                                │
//!                                       ┌────────▼─────────┐
//!                                       │SessionCoordinator│
//!                                       └──┬──────┬─────┬──┘
//!                                          │      │     │
//!                          SessionRegistry ┘      │     └ BroadcastEngine
//!                          (admin, waiting)   ActionLog   (ordered fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`action`]: drawing action model
//! - [`action_log`]: append-only log and the LZ4 canvas blob
//! - [`registry`]: admin election, membership, waiting list
//! - [`broadcast`]: ordered, per-recipient asynchronous delivery
//! - [`coordinator`]: request validation and sequencing
//! - [`protocol`]: bincode request/reply/event frames
//! - [`server`]: WebSocket session server
//! - [`client`]: WebSocket client

pub mod action;
pub mod action_log;
pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-exports for convenience
pub use action::{Action, ActionKind, Bounds, Point, ShapeKind, TextPayload};
pub use action_log::{ActionLog, CanvasBlob};
pub use broadcast::{BroadcastConfig, BroadcastEngine, BroadcastStats, Eviction};
pub use client::{ClientError, ConnectionState, WhiteboardClient, WhiteboardEvent};
pub use coordinator::{SessionCoordinator, SYSTEM_SENDER};
pub use error::{SessionError, SessionResult};
pub use handle::{ClientEvent, ClientHandle};
pub use protocol::{ClientFrame, ProtocolError, ReplyBody, Request, ServerFrame, MAX_FRAME_BYTES};
pub use registry::{Departure, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SessionServer};
