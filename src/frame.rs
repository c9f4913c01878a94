//! Timestamped frame acquisition
//!
//! Grabbing and encoding images is left to the caller. This module paces a
//! grab closure on a producer thread and hands frames to a consumer through a
//! bounded queue that drops incoming frames instead of blocking.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameStats {
    pub frame_count: u64,
    pub dropped_frames: u64,
    pub queue_size: usize,
    pub fps: f64,
}

/// A source of `(timestamp, image)` pairs
pub trait FrameSource<T> {
    fn start(&mut self) -> std::io::Result<()>;
    fn get_frame(&self, timeout: Duration) -> Option<(f64, T)>;
    fn stop(&mut self);
    fn stats(&self) -> FrameStats;
}

/// Bounded handoff between one producer and one consumer
#[derive(Debug)]
pub struct FrameQueue<T> {
    tx: Sender<(f64, T)>,
    rx: Receiver<(f64, T)>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. A full queue drops `frame`; what is already
    /// queued stays.
    pub fn push(&self, timestamp: f64, frame: T) -> bool {
        match self.tx.try_send((timestamp, frame)) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self, timeout: Duration) -> Option<(f64, T)> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

type GrabFn<T> = Box<dyn FnMut() -> Option<T> + Send>;

/// Calls a grab closure at a fixed rate on its own thread.
///
/// Frame `i` is due at `start + i / fps`. A slow grab makes later frames
/// catch up instead of shifting the whole schedule.
pub struct PacedFrameSource<T> {
    fps: f64,
    queue: Arc<FrameQueue<T>>,
    grab: Option<GrabFn<T>>,
    running: Arc<AtomicBool>,
    started: Option<Instant>,
    stopped: Option<Instant>,
    producer: Option<JoinHandle<GrabFn<T>>>,
}

impl PacedFrameSource<Instant> {
    /// A source whose frames are their own capture instants. Stands in for a
    /// screen grabber when only the frame timing is recorded.
    pub fn clock(fps: f64, capacity: usize) -> Self {
        Self::new(fps, capacity, || Some(Instant::now()))
    }
}

impl<T: Send + 'static> PacedFrameSource<T> {
    pub fn new(
        fps: f64,
        capacity: usize,
        grab: impl FnMut() -> Option<T> + Send + 'static,
    ) -> Self {
        Self {
            fps,
            queue: Arc::new(FrameQueue::new(capacity)),
            grab: Some(Box::new(grab)),
            running: Arc::new(AtomicBool::new(false)),
            started: None,
            stopped: None,
            producer: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take every queued frame without waiting
    pub fn drain(&self) -> Vec<(f64, T)> {
        std::iter::from_fn(|| self.queue.pop(Duration::ZERO)).collect()
    }
}

impl<T: Send + 'static> FrameSource<T> for PacedFrameSource<T> {
    fn start(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid frame rate {}", self.fps),
            ));
        }
        let Some(mut grab) = self.grab.take() else {
            return Err(std::io::Error::other("frame grabber was lost"));
        };
        self.running.store(true, Ordering::Release);
        let start = Instant::now();
        self.started = Some(start);
        self.stopped = None;

        let interval = Duration::from_secs_f64(1.0 / self.fps);
        let queue = Arc::clone(&self.queue);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                let mut index: u32 = 0;
                while running.load(Ordering::Acquire) {
                    let due = start + interval * index;
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                    index = index.saturating_add(1);

                    let Some(frame) = grab() else {
                        continue;
                    };
                    let timestamp = start.elapsed().as_secs_f64();
                    if !queue.push(timestamp, frame) {
                        debug!(timestamp, "frame queue full, frame dropped");
                    }
                }
                grab
            });
        match handle {
            Ok(handle) => {
                self.producer = Some(handle);
                info!(fps = self.fps, "frame source started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn get_frame(&self, timeout: Duration) -> Option<(f64, T)> {
        self.queue.pop(timeout)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.started.is_some() && self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
        if let Some(handle) = self.producer.take() {
            match handle.join() {
                Ok(grab) => self.grab = Some(grab),
                Err(_) => warn!("frame producer panicked"),
            }
        }
        let stats = self.stats();
        info!(
            frames = stats.frame_count,
            dropped = stats.dropped_frames,
            "frame source stopped"
        );
    }

    fn stats(&self) -> FrameStats {
        let frame_count = self.queue.pushed();
        // Rate over the running period only
        let running_for = self
            .started
            .map(|start| self.stopped.unwrap_or_else(Instant::now) - start)
            .unwrap_or_default();
        let fps = if running_for > Duration::ZERO {
            frame_count as f64 / running_for.as_secs_f64()
        } else {
            0.0
        };
        FrameStats {
            frame_count,
            dropped_frames: self.queue.dropped(),
            queue_size: self.queue.len(),
            fps,
        }
    }
}

impl<T> Drop for PacedFrameSource<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_incoming() {
        let queue = FrameQueue::new(2);
        assert!(queue.push(0.0, "a"));
        assert!(queue.push(0.1, "b"));
        assert!(!queue.push(0.2, "c"));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);

        // Oldest frames survive
        assert_eq!(queue.pop(Duration::ZERO), Some((0.0, "a")));
        assert_eq!(queue.pop(Duration::ZERO), Some((0.1, "b")));
        assert_eq!(queue.pop(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_paced_source_produces_timestamped_frames() {
        let mut counter = 0u32;
        let mut source = PacedFrameSource::new(100.0, 300, move || {
            counter += 1;
            Some(counter)
        });
        source.start().unwrap();
        let mut frames = Vec::new();
        while frames.len() < 5 {
            if let Some(frame) = source.get_frame(Duration::from_secs(1)) {
                frames.push(frame);
            }
        }
        source.stop();

        let stamps: Vec<f64> = frames.iter().map(|(t, _)| *t).collect();
        assert!(stamps.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(frames[0].1, 1);
        let stats = source.stats();
        assert!(stats.frame_count >= 5);
        assert_eq!(stats.dropped_frames, 0);
        assert!(stats.fps > 0.0);

        // The rate stops counting time once the source is stopped
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.stats().fps, stats.fps);
    }

    #[test]
    fn test_unconsumed_source_drops_when_full() {
        let mut source = PacedFrameSource::new(500.0, 3, || Some(()));
        source.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        source.stop();
        let stats = source.stats();
        assert_eq!(stats.queue_size, 3);
        assert!(stats.dropped_frames > 0);
        assert_eq!(stats.frame_count, 3);
    }

    #[test]
    fn test_clock_frames_are_capture_instants() {
        let before = Instant::now();
        let mut source = PacedFrameSource::clock(200.0, 10);
        source.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        source.stop();

        let frames = source.drain();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|(_, at)| *at >= before));
        assert!(source.drain().is_empty());
        assert_eq!(source.stats().queue_size, 0);
    }

    #[test]
    fn test_invalid_rate_refuses_to_start() {
        let mut source = PacedFrameSource::new(0.0, 3, || Some(()));
        assert!(source.start().is_err());
        assert!(!source.is_running());
    }
}
