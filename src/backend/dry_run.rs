//! Backend that injects nothing and records what it would have done

use super::{Backend, BackendError, Held};
use crate::key::{ButtonId, KeyIdentifier};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    KeyDown(KeyIdentifier),
    KeyUp(KeyIdentifier),
    PointerMove(i32, i32),
    PointerDown(ButtonId),
    PointerUp(ButtonId),
    Scroll(i32, i32),
}

/// A call together with when it was made
#[derive(Debug, Clone)]
pub struct TimedCall {
    pub at: Instant,
    pub call: BackendCall,
}

pub type CallLog = Arc<Mutex<Vec<TimedCall>>>;

/// Only effective actions are recorded: pressing a held key or releasing a
/// free one records nothing, just as a real backend would inject nothing.
#[derive(Debug, Default)]
pub struct DryRunBackend {
    calls: CallLog,
    keys: Held<KeyIdentifier, ()>,
    buttons: Held<ButtonId, ()>,
    rejected: BTreeSet<KeyIdentifier>,
    verbose: bool,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every recorded call at info level
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Treat `key` as unmapped
    pub fn reject(mut self, key: KeyIdentifier) -> Self {
        self.rejected.insert(key);
        self
    }

    /// Shared handle to the recorded calls, usable after the backend is boxed
    pub fn call_log(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().iter().map(|c| c.call.clone()).collect()
    }

    fn record(&mut self, call: BackendCall) {
        if self.verbose {
            info!(?call, "dry run");
        }
        self.calls.lock().push(TimedCall {
            at: Instant::now(),
            call,
        });
    }
}

impl Backend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        if self.rejected.contains(key) {
            return Err(BackendError::UnknownKey(*key));
        }
        if self.keys.contains(key) {
            return Ok(());
        }
        self.keys.insert(*key, ());
        self.record(BackendCall::KeyDown(*key));
        Ok(())
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        if self.keys.release(key).is_some() {
            self.record(BackendCall::KeyUp(*key));
        }
        Ok(())
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.record(BackendCall::PointerMove(dx, dy));
        Ok(())
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        if self.buttons.contains(&button) {
            return Ok(());
        }
        self.buttons.insert(button, ());
        self.record(BackendCall::PointerDown(button));
        Ok(())
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        if self.buttons.release(&button).is_some() {
            self.record(BackendCall::PointerUp(button));
        }
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.record(BackendCall::Scroll(dx, dy));
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), BackendError> {
        for (key, ()) in self.keys.drain() {
            self.record(BackendCall::KeyUp(key));
        }
        for (button, ()) in self.buttons.drain() {
            self.record(BackendCall::PointerUp(button));
        }
        Ok(())
    }
}
