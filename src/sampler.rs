//! Reconstructing interaction state from an event log
//!
//! `state_at` is the reference fold. `StateCursor` gives the same answers for
//! a sequence of queries without rescanning from the start each time, which is
//! what `resample` uses to build the frame-aligned sequence.

use crate::event::{EventKind, InputEvent};
use crate::key::{ButtonId, KeyIdentifier};
use crate::log::EventLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Held keys, pointer position and held buttons at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractionState {
    pub pressed_keys: BTreeSet<KeyIdentifier>,
    pub pointer_position: (i32, i32),
    pub pressed_buttons: BTreeSet<ButtonId>,
}

impl InteractionState {
    /// Fold one event into the state. Presses of held keys and releases of
    /// free keys leave the state unchanged.
    pub fn apply(&mut self, event: &InputEvent) {
        match &event.kind {
            EventKind::KeyPress { key } => {
                self.pressed_keys.insert(*key);
            }
            EventKind::KeyRelease { key } => {
                self.pressed_keys.remove(key);
            }
            EventKind::PointerMove { x, y, .. } => {
                self.pointer_position = (*x, *y);
            }
            EventKind::PointerPress { button, .. } => {
                self.pressed_buttons.insert(*button);
            }
            EventKind::PointerRelease { button, .. } => {
                self.pressed_buttons.remove(button);
            }
            EventKind::Scroll { .. } => {}
        }
    }
}

/// State after every event with `timestamp <= t`, in log order
pub fn state_at(log: &EventLog, t: f64) -> InteractionState {
    let mut state = InteractionState::default();
    for event in log {
        if event.timestamp > t {
            break;
        }
        state.apply(event);
    }
    state
}

/// Incremental `state_at` for queries that mostly move forward in time
#[derive(Debug)]
pub struct StateCursor<'a> {
    events: &'a [InputEvent],
    next: usize,
    last_query: f64,
    state: InteractionState,
}

impl<'a> StateCursor<'a> {
    pub fn new(log: &'a EventLog) -> Self {
        Self {
            events: log.events(),
            next: 0,
            last_query: f64::NEG_INFINITY,
            state: InteractionState::default(),
        }
    }

    pub fn state_at(&mut self, t: f64) -> &InteractionState {
        if t < self.last_query {
            self.next = 0;
            self.state = InteractionState::default();
        }
        self.last_query = t;

        while let Some(event) = self.events.get(self.next) {
            if event.timestamp > t {
                break;
            }
            self.state.apply(event);
            self.next += 1;
        }
        &self.state
    }
}

/// Number of frames `resample` produces for a log
pub fn frame_count(log: &EventLog, fps: f64) -> usize {
    if log.is_empty() || !(fps > 0.0) {
        return 0;
    }
    (log.duration() * fps).floor() as usize + 1
}

/// State sampled at `i / fps` for `i` in `0..=floor(duration * fps)`
pub fn resample(log: &EventLog, fps: f64) -> Vec<(f64, InteractionState)> {
    let count = frame_count(log, fps);
    let mut cursor = StateCursor::new(log);
    (0..count)
        .map(|i| {
            let timestamp = i as f64 / fps;
            (timestamp, cursor.state_at(timestamp).clone())
        })
        .collect()
}

/// One entry of the frame-aligned training sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAlignedEntry {
    pub timestamp: f64,
    pub pressed_keys: Vec<String>,
    pub mouse_x: i32,
    pub mouse_y: i32,
    pub mouse_buttons: Vec<String>,
}

impl FrameAlignedEntry {
    pub fn new(timestamp: f64, state: &InteractionState) -> Self {
        Self {
            timestamp,
            pressed_keys: state.pressed_keys.iter().map(|k| k.to_string()).collect(),
            mouse_x: state.pointer_position.0,
            mouse_y: state.pointer_position.1,
            mouse_buttons: state.pressed_buttons.iter().map(|b| b.to_string()).collect(),
        }
    }
}

pub fn frame_aligned(log: &EventLog, fps: f64) -> Vec<FrameAlignedEntry> {
    resample(log, fps)
        .iter()
        .map(|(timestamp, state)| FrameAlignedEntry::new(*timestamp, state))
        .collect()
}
