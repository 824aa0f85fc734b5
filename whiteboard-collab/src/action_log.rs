//! Append-only, in-memory action log and the canvas blob codec.
//!
//! Blob layout:
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────────────┐
//! │ "WBv1"   │ u32 LE size  │ LZ4 block (bincode Vec<Action>)  │
//! │ 4 bytes  │ 4 bytes      │ variable                         │
//! └──────────┴──────────────┴──────────────────────────────────┘
//! ```
//! An empty log encodes to an empty blob, and an empty blob restores to an
//! empty log.

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::{SessionError, SessionResult};

const BLOB_MAGIC: &[u8; 4] = b"WBv1";

/// Largest decompressed action list a blob may declare.
pub const MAX_CANVAS_BYTES: usize = 64 * 1024 * 1024;

/// Opaque encoded form of an action sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanvasBlob(Vec<u8>);

impl CanvasBlob {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encode an action sequence.
    pub fn encode(actions: &[Action]) -> SessionResult<Self> {
        if actions.is_empty() {
            return Ok(Self::empty());
        }
        let raw = bincode::serde::encode_to_vec(actions, bincode::config::standard())
            .map_err(|e| SessionError::CorruptData(format!("encode failed: {e}")))?;
        let mut bytes = Vec::with_capacity(BLOB_MAGIC.len() + raw.len() / 2);
        bytes.extend_from_slice(BLOB_MAGIC);
        bytes.extend_from_slice(&lz4_flex::compress_prepend_size(&raw));
        Ok(Self(bytes))
    }

    /// Decode back into the ordered action sequence.
    pub fn decode(&self) -> SessionResult<Vec<Action>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .0
            .strip_prefix(BLOB_MAGIC.as_slice())
            .ok_or_else(|| SessionError::CorruptData("missing canvas header".into()))?;
        let declared = body
            .first_chunk::<4>()
            .map(|size| u32::from_le_bytes(*size) as usize)
            .ok_or_else(|| SessionError::CorruptData("missing canvas size".into()))?;
        if declared > MAX_CANVAS_BYTES {
            return Err(SessionError::CorruptData(format!(
                "canvas declares {declared} bytes, limit is {MAX_CANVAS_BYTES}"
            )));
        }
        let raw = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| SessionError::CorruptData(e.to_string()))?;
        let config = bincode::config::standard().with_limit::<MAX_CANVAS_BYTES>();
        let (actions, read): (Vec<Action>, usize) = bincode::serde::decode_from_slice(&raw, config)
            .map_err(|e| SessionError::CorruptData(e.to_string()))?;
        if read != raw.len() {
            return Err(SessionError::CorruptData(format!(
                "{} trailing bytes after action list",
                raw.len() - read
            )));
        }
        Ok(actions)
    }
}

impl From<Vec<u8>> for CanvasBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Ordered store of accepted actions, in server-arrival order.
#[derive(Debug, Default)]
pub struct ActionLog {
    actions: Vec<Action>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Encode the whole log, for catching up a joiner or saving to a file.
    pub fn snapshot(&self) -> SessionResult<CanvasBlob> {
        CanvasBlob::encode(&self.actions)
    }

    /// Replace the whole log with the blob's content.
    ///
    /// On [`SessionError::CorruptData`] the current log is left untouched.
    /// Returns the number of restored actions.
    pub fn restore(&mut self, blob: &CanvasBlob) -> SessionResult<usize> {
        let actions = blob.decode()?;
        self.actions = actions;
        Ok(self.actions.len())
    }
}
