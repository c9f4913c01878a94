//! Real-time replay of an event log through a backend
//!
//! Every event is scheduled against one fixed start instant:
//! `deadline_i = start + timestamp_i / speed`. A slow backend call delays the
//! event it belongs to, never the ones after it.

use crate::backend::{Backend, BackendError};
use crate::config::ReplayConfig;
use crate::event::{EventKind, InputEvent};
use crate::log::EventLog;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum ReplayError {
    #[error("replay speed must be positive and finite, got {0}")]
    InvalidSpeed(f64),
    #[error("start delay must be a non-negative number of seconds, got {0}")]
    InvalidStartDelay(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    /// Waiting out the start delay
    Armed,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub speed: f64,
    pub start_delay: Duration,
    /// Log progress every this many events, 0 to disable
    pub progress_every: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            start_delay: Duration::ZERO,
            progress_every: 100,
        }
    }
}

impl ReplayOptions {
    pub fn new(speed: f64, start_delay_secs: f64) -> Result<Self, ReplayError> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(ReplayError::InvalidSpeed(speed));
        }
        let start_delay = Duration::try_from_secs_f64(start_delay_secs)
            .map_err(|_| ReplayError::InvalidStartDelay(start_delay_secs))?;
        Ok(Self {
            speed,
            start_delay,
            ..Self::default()
        })
    }

    pub fn from_config(config: &ReplayConfig) -> Result<Self, ReplayError> {
        let mut options = Self::new(config.speed, config.start_delay_secs)?;
        options.progress_every = config.progress_every;
        Ok(options)
    }
}

/// Cooperative cancellation shared between the replay loop and whoever
/// wants to stop it
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block for up to `timeout`. Returns true if stopped meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let mut stopped = lock.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !*stopped {
                    if condvar.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*stopped {
                    condvar.wait(&mut stopped);
                }
            }
        }
        *stopped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub state: ReplayState,
    pub total: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Releases everything the backend holds when dropped, whichever way the
/// replay ends
struct ReleaseGuard<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
}

impl<B: Backend + ?Sized> Drop for ReleaseGuard<'_, B> {
    fn drop(&mut self) {
        match self.backend.release_all() {
            Ok(()) => debug!(backend = self.backend.name(), "released all held input"),
            Err(e) => warn!(backend = self.backend.name(), error = %e, "release_all failed"),
        }
    }
}

pub struct Replayer {
    options: ReplayOptions,
    stop: StopSignal,
    state: ReplayState,
}

impl Replayer {
    pub fn new(options: ReplayOptions) -> Self {
        Self {
            options,
            stop: StopSignal::new(),
            state: ReplayState::Idle,
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    /// Later runs start at once. Used when looping a session.
    pub fn skip_start_delay(&mut self) {
        self.options.start_delay = Duration::ZERO;
    }

    /// Replay `log` through `backend`. Per-event failures are logged and
    /// counted; the replay carries on with the next event.
    pub fn run<B: Backend + ?Sized>(&mut self, log: &EventLog, backend: &mut B) -> ReplayReport {
        let total = log.len();
        let guard = ReleaseGuard { backend };
        let began = Instant::now();

        self.state = ReplayState::Armed;
        if !self.options.start_delay.is_zero() {
            info!(delay = ?self.options.start_delay, "replay armed");
        }
        if self.stop.wait_timeout(self.options.start_delay) {
            drop(guard);
            self.state = ReplayState::Cancelled;
            info!("replay cancelled before start");
            return self.report(total, 0, 0, began.elapsed());
        }

        self.state = ReplayState::Running;
        info!(
            events = total,
            speed = self.options.speed,
            backend = guard.backend.name(),
            "replay started"
        );

        let start = Instant::now();
        let mut dispatcher = Dispatcher::default();
        let (mut dispatched, mut failed) = (0, 0);
        let mut cancelled = false;

        for (index, event) in log.iter().enumerate() {
            if self.stop.is_stopped() {
                cancelled = true;
                break;
            }

            let remaining = deadline_offset(event.timestamp, self.options.speed)
                .checked_sub(start.elapsed())
                .unwrap_or(Duration::ZERO);
            if !remaining.is_zero() && self.stop.wait_timeout(remaining) {
                cancelled = true;
                break;
            }

            match dispatcher.dispatch(&mut *guard.backend, event) {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        index,
                        event = %event.kind,
                        error = %e,
                        "event dispatch failed, continuing"
                    );
                }
            }

            let done = index + 1;
            if self.options.progress_every > 0 && done % self.options.progress_every == 0 {
                info!(
                    done,
                    total,
                    progress = format!("{:.1}%", done as f64 * 100.0 / total as f64),
                    "replay progress"
                );
            }
        }

        let elapsed = start.elapsed();
        drop(guard);
        self.state = if cancelled {
            ReplayState::Cancelled
        } else {
            ReplayState::Completed
        };
        info!(state = ?self.state, dispatched, failed, ?elapsed, "replay finished");
        self.report(total, dispatched, failed, elapsed)
    }

    fn report(
        &self,
        total: usize,
        dispatched: usize,
        failed: usize,
        elapsed: Duration,
    ) -> ReplayReport {
        ReplayReport {
            state: self.state,
            total,
            dispatched,
            failed,
            elapsed,
        }
    }
}

/// Offset from replay start at which an event is due
fn deadline_offset(timestamp: f64, speed: f64) -> Duration {
    Duration::try_from_secs_f64(timestamp / speed).unwrap_or(Duration::MAX)
}

/// Turns events into backend calls, deriving pointer deltas for moves that
/// only carry a position
#[derive(Debug, Default)]
struct Dispatcher {
    pointer: Option<(i32, i32)>,
}

impl Dispatcher {
    fn dispatch<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        event: &InputEvent,
    ) -> Result<(), BackendError> {
        match &event.kind {
            EventKind::KeyPress { key } => backend.key_down(key),
            EventKind::KeyRelease { key } => backend.key_up(key),
            EventKind::PointerMove { x, y, dx, dy } => {
                let delta = match (dx, dy, self.pointer) {
                    (Some(dx), Some(dy), _) => Some((*dx, *dy)),
                    (_, _, Some((px, py))) => Some((x - px, y - py)),
                    _ => None,
                };
                self.pointer = Some((*x, *y));
                match delta {
                    Some((0, 0)) | None => Ok(()),
                    Some((dx, dy)) => backend.pointer_move_relative(dx, dy),
                }
            }
            EventKind::PointerPress { x, y, button } => {
                self.pointer = Some((*x, *y));
                backend.pointer_down(*button)
            }
            EventKind::PointerRelease { x, y, button } => {
                self.pointer = Some((*x, *y));
                backend.pointer_up(*button)
            }
            EventKind::Scroll { dx, dy, .. } => backend.scroll(*dx, *dy),
        }
    }
}

/// Replay with the given pacing and a fresh, never-triggered stop signal
pub fn replay<B: Backend + ?Sized>(
    log: &EventLog,
    backend: &mut B,
    speed: f64,
    start_delay_secs: f64,
) -> Result<ReplayReport, ReplayError> {
    let options = ReplayOptions::new(speed, start_delay_secs)?;
    Ok(Replayer::new(options).run(log, backend))
}
