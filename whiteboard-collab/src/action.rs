//! Whiteboard edit actions.
//!
//! An [`Action`] is one atomic edit made by one user: a stroke, an erase
//! pass, or a text box being added or removed. The server never interprets
//! geometry; it only logs actions in arrival order and relays them.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// 2D point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Shape produced by a draw tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Line,
    Rectangle,
    Oval,
    Triangle,
    Freehand,
    Eraser,
}

/// Axis-aligned bounding box of a text element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

/// Text element carried by text add/remove actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    pub position: Point,
    pub scale: f64,
    /// Hex color, e.g. `#000000`
    pub color: String,
    pub bounds: Bounds,
}

/// Kind-specific part of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    Draw {
        shape: ShapeKind,
        points: Vec<Point>,
        color: String,
        stroke_width: f64,
    },
    Erase {
        path: Vec<Point>,
        eraser_size: f64,
    },
    TextAdd(TextPayload),
    TextRemove(TextPayload),
}

impl ActionKind {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draw { .. } => "draw",
            Self::Erase { .. } => "erase",
            Self::TextAdd(_) => "text_add",
            Self::TextRemove(_) => "text_remove",
        }
    }
}

/// One whiteboard edit.
///
/// `id` is assigned by the server when the action is accepted into the log;
/// clients may leave it at zero. `author` is likewise overwritten with the
/// authenticated sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub author: String,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at_ms: u64,
    pub kind: ActionKind,
}

impl Action {
    /// Create an action stamped with the current time.
    pub fn new(author: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: 0,
            author: author.into(),
            created_at_ms: now_ms(),
            kind,
        }
    }

    pub fn draw(
        author: impl Into<String>,
        shape: ShapeKind,
        points: Vec<Point>,
        color: impl Into<String>,
        stroke_width: f64,
    ) -> Self {
        Self::new(
            author,
            ActionKind::Draw {
                shape,
                points,
                color: color.into(),
                stroke_width,
            },
        )
    }

    pub fn erase(author: impl Into<String>, path: Vec<Point>, eraser_size: f64) -> Self {
        Self::new(author, ActionKind::Erase { path, eraser_size })
    }

    pub fn text_add(author: impl Into<String>, payload: TextPayload) -> Self {
        Self::new(author, ActionKind::TextAdd(payload))
    }

    pub fn text_remove(author: impl Into<String>, payload: TextPayload) -> Self {
        Self::new(author, ActionKind::TextRemove(payload))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
