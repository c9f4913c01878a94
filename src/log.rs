//! Append-only, timestamp-ordered event log

use crate::event::InputEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LogError {
    #[error("event at {timestamp}s precedes the last logged event at {last}s")]
    OutOfOrder { timestamp: f64, last: f64 },
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(f64),
}

/// Ordered sequence of events, non-decreasing in timestamp
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(into = "PersistedLog")]
pub struct EventLog {
    events: Vec<InputEvent>,
}

/// On-disk wrapper: `{events, total_events, duration}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedLog {
    pub events: Vec<InputEvent>,
    #[serde(default)]
    pub total_events: usize,
    #[serde(default)]
    pub duration: f64,
}

impl From<EventLog> for PersistedLog {
    fn from(log: EventLog) -> Self {
        Self {
            total_events: log.len(),
            duration: log.duration(),
            events: log.events,
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from events that are already in order
    pub fn from_events(events: Vec<InputEvent>) -> Result<Self, LogError> {
        let mut log = Self::with_capacity(events.len());
        for event in events {
            log.append(event)?;
        }
        Ok(log)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, event: InputEvent) -> Result<(), LogError> {
        if !event.timestamp.is_finite() || event.timestamp < 0.0 {
            return Err(LogError::InvalidTimestamp(event.timestamp));
        }
        if let Some(last) = self.last_timestamp() {
            if event.timestamp < last {
                return Err(LogError::OutOfOrder {
                    timestamp: event.timestamp,
                    last,
                });
            }
        }
        self.events.push(event);
        Ok(())
    }

    pub fn events(&self) -> &[InputEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, InputEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.events.last().map(|e| e.timestamp)
    }

    /// Timestamp of the final event, 0 for an empty log
    pub fn duration(&self) -> f64 {
        self.last_timestamp().unwrap_or(0.0)
    }

    /// Number of events per persisted type tag
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.kind.type_name()).or_insert(0) += 1;
        }
        counts
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a InputEvent;
    type IntoIter = std::slice::Iter<'a, InputEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Log shared between the single capture writer and live readers.
///
/// Readers never see a partially appended event: they either copy a snapshot
/// or look at a length under the read lock.
#[derive(Debug, Clone, Default)]
pub struct SharedLog {
    inner: Arc<RwLock<EventLog>>,
}

impl SharedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: InputEvent) -> Result<(), LogError> {
        self.inner.write().append(event)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn last_timestamp(&self) -> Option<f64> {
        self.inner.read().last_timestamp()
    }

    pub fn clear(&self) {
        *self.inner.write() = EventLog::new();
    }

    pub fn snapshot(&self) -> EventLog {
        self.inner.read().clone()
    }

    /// Hand the log over, leaving an empty one behind
    pub fn take(&self) -> EventLog {
        std::mem::take(&mut *self.inner.write())
    }
}
