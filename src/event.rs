//! Timestamped input events and their persisted shape
//!
//! On disk each event is `{"timestamp": 0.1, "type": "key_press", "data": {...}}`.

use crate::key::{ButtonId, KeyIdentifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One recorded key or pointer action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Seconds since the session started
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    /// Persisted as `key_id`. Older logs used `key`.
    #[serde(rename = "key_press")]
    KeyPress {
        #[serde(rename = "key_id", alias = "key")]
        key: KeyIdentifier,
    },
    #[serde(rename = "key_release")]
    KeyRelease {
        #[serde(rename = "key_id", alias = "key")]
        key: KeyIdentifier,
    },
    /// `x`/`y` is the accumulated pointer position, `dx`/`dy` the delta that
    /// produced it. Logs written by older tools may lack the delta.
    #[serde(rename = "mouse_move")]
    PointerMove {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dx: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dy: Option<i32>,
    },
    #[serde(rename = "mouse_press")]
    PointerPress { x: i32, y: i32, button: ButtonId },
    #[serde(rename = "mouse_release")]
    PointerRelease { x: i32, y: i32, button: ButtonId },
    #[serde(rename = "mouse_scroll")]
    Scroll { x: i32, y: i32, dx: i32, dy: i32 },
}

impl EventKind {
    /// Persisted type tag
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::KeyPress { .. } => "key_press",
            EventKind::KeyRelease { .. } => "key_release",
            EventKind::PointerMove { .. } => "mouse_move",
            EventKind::PointerPress { .. } => "mouse_press",
            EventKind::PointerRelease { .. } => "mouse_release",
            EventKind::Scroll { .. } => "mouse_scroll",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::KeyPress { key } => write!(f, "press {}", key),
            EventKind::KeyRelease { key } => write!(f, "release {}", key),
            EventKind::PointerMove { x, y, .. } => write!(f, "move to {},{}", x, y),
            EventKind::PointerPress { button, .. } => write!(f, "press mouse {}", button),
            EventKind::PointerRelease { button, .. } => write!(f, "release mouse {}", button),
            EventKind::Scroll { dx, dy, .. } => write!(f, "scroll {},{}", dx, dy),
        }
    }
}

impl InputEvent {
    pub fn new(timestamp: f64, kind: EventKind) -> Self {
        Self { timestamp, kind }
    }

    pub fn key_press(timestamp: f64, key: KeyIdentifier) -> Self {
        Self::new(timestamp, EventKind::KeyPress { key })
    }

    pub fn key_release(timestamp: f64, key: KeyIdentifier) -> Self {
        Self::new(timestamp, EventKind::KeyRelease { key })
    }

    pub fn pointer_move(timestamp: f64, x: i32, y: i32, dx: i32, dy: i32) -> Self {
        Self::new(
            timestamp,
            EventKind::PointerMove {
                x,
                y,
                dx: Some(dx),
                dy: Some(dy),
            },
        )
    }

    pub fn pointer_press(timestamp: f64, button: ButtonId, (x, y): (i32, i32)) -> Self {
        Self::new(timestamp, EventKind::PointerPress { x, y, button })
    }

    pub fn pointer_release(timestamp: f64, button: ButtonId, (x, y): (i32, i32)) -> Self {
        Self::new(timestamp, EventKind::PointerRelease { x, y, button })
    }

    pub fn scroll(timestamp: f64, dx: i32, dy: i32, (x, y): (i32, i32)) -> Self {
        Self::new(timestamp, EventKind::Scroll { x, y, dx, dy })
    }
}
