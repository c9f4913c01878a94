//! Capturing input events from keyboards and mice
//!
//! One reader thread per evdev device translates native events and forwards
//! them, stamped with their capture instant, to a single consumer thread. The
//! consumer owns the debounce state and is the only writer of the log.

use crate::event::InputEvent;
use crate::key::{ButtonId, KeyIdentifier};
use crate::log::SharedLog;
use crossbeam_channel::{Receiver, Sender, unbounded};
use evdev::{Device, EventSummary, InputEvent as NativeEvent, RelativeAxisCode};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    /// Auto-repeat while held
    Repeat,
    Release,
}

impl KeyAction {
    fn from_value(value: i32) -> Self {
        match value {
            0 => KeyAction::Release,
            2 => KeyAction::Repeat,
            _ => KeyAction::Press,
        }
    }

    fn is_down(self) -> bool {
        self != KeyAction::Release
    }
}

/// A device-independent input, before debouncing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInput {
    Key { key: KeyIdentifier, action: KeyAction },
    Button { button: ButtonId, action: KeyAction },
    Motion { dx: i32, dy: i32 },
    Scroll { dx: i32, dy: i32 },
}

/// Turns one device's native event stream into `RawInput`s.
///
/// Relative X/Y reports are held until the end of their SYN frame so a
/// diagonal movement becomes one motion.
#[derive(Debug, Default)]
pub struct Translator {
    dx: i32,
    dy: i32,
}

impl Translator {
    pub fn translate(&mut self, event: &NativeEvent) -> Option<RawInput> {
        match event.destructure() {
            EventSummary::Key(_, code, value) => {
                let action = KeyAction::from_value(value);
                if ButtonId::is_pointer_button(code) {
                    Some(RawInput::Button {
                        button: ButtonId::from_key_code(code),
                        action,
                    })
                } else {
                    Some(RawInput::Key {
                        key: KeyIdentifier::from_key_code(code),
                        action,
                    })
                }
            }
            EventSummary::RelativeAxis(_, RelativeAxisCode::REL_X, value) => {
                self.dx += value;
                None
            }
            EventSummary::RelativeAxis(_, RelativeAxisCode::REL_Y, value) => {
                self.dy += value;
                None
            }
            EventSummary::RelativeAxis(_, RelativeAxisCode::REL_WHEEL, value) => {
                Some(RawInput::Scroll { dx: 0, dy: value })
            }
            EventSummary::RelativeAxis(_, RelativeAxisCode::REL_HWHEEL, value) => {
                Some(RawInput::Scroll { dx: value, dy: 0 })
            }
            EventSummary::Synchronization(..) => {
                let (dx, dy) = (std::mem::take(&mut self.dx), std::mem::take(&mut self.dy));
                (dx != 0 || dy != 0).then_some(RawInput::Motion { dx, dy })
            }
            _ => None,
        }
    }
}

/// Debounces raw inputs into log events and tracks the pointer position
#[derive(Debug, Default, Clone)]
pub struct InputNormalizer {
    pressed_keys: BTreeSet<KeyIdentifier>,
    pressed_buttons: BTreeSet<ButtonId>,
    position: (i32, i32),
}

impl InputNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, timestamp: f64, input: RawInput) -> Option<InputEvent> {
        match input {
            RawInput::Key { key, action } if action.is_down() => self
                .pressed_keys
                .insert(key)
                .then(|| InputEvent::key_press(timestamp, key)),
            RawInput::Key { key, .. } => self
                .pressed_keys
                .remove(&key)
                .then(|| InputEvent::key_release(timestamp, key)),
            RawInput::Button { button, action } if action.is_down() => self
                .pressed_buttons
                .insert(button)
                .then(|| InputEvent::pointer_press(timestamp, button, self.position)),
            RawInput::Button { button, .. } => self
                .pressed_buttons
                .remove(&button)
                .then(|| InputEvent::pointer_release(timestamp, button, self.position)),
            RawInput::Motion { dx, dy } => {
                self.position = (self.position.0 + dx, self.position.1 + dy);
                let (x, y) = self.position;
                Some(InputEvent::pointer_move(timestamp, x, y, dx, dy))
            }
            RawInput::Scroll { dx, dy } => {
                Some(InputEvent::scroll(timestamp, dx, dy, self.position))
            }
        }
    }

    pub fn pressed_keys(&self) -> &BTreeSet<KeyIdentifier> {
        &self.pressed_keys
    }

    pub fn pressed_buttons(&self) -> &BTreeSet<ButtonId> {
        &self.pressed_buttons
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderNotice {
    Started,
    Stopped { events: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderStatus {
    pub recording: bool,
    pub total_events: usize,
    pub event_counts: BTreeMap<&'static str, usize>,
    pub pressed_keys: Vec<KeyIdentifier>,
    pub pressed_buttons: Vec<ButtonId>,
    pub duration: f64,
}

enum Message {
    Input { at: Instant, input: RawInput },
    Start(Instant),
    Stop(Instant),
    Shutdown,
}

/// What the consumer exposes to status readers
#[derive(Debug, Default)]
struct Live {
    recording: bool,
    counts: BTreeMap<&'static str, usize>,
    pressed_keys: Vec<KeyIdentifier>,
    pressed_buttons: Vec<ButtonId>,
}

pub struct Recorder {
    tx: Sender<Message>,
    notices: Receiver<RecorderNotice>,
    log: SharedLog,
    live: Arc<RwLock<Live>>,
    consumer: Option<JoinHandle<()>>,
    devices: usize,
}

impl Recorder {
    /// `toggle_key` starts and stops recording when pressed on any attached
    /// device. It is never recorded.
    pub fn new(toggle_key: Option<KeyIdentifier>) -> Self {
        let (tx, rx) = unbounded();
        let (notice_tx, notices) = unbounded();
        let log = SharedLog::new();
        let live = Arc::new(RwLock::new(Live::default()));

        let consumer = Consumer {
            log: log.clone(),
            live: Arc::clone(&live),
            notices: notice_tx,
            toggle_key,
            normalizer: InputNormalizer::new(),
            started: None,
        };
        let handle = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || consumer.run(rx));
        let consumer = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not spawn recorder thread");
                None
            }
        };

        Self {
            tx,
            notices,
            log,
            live,
            consumer,
            devices: 0,
        }
    }

    /// Read `device` on its own thread until it errors or the recorder is gone
    pub fn attach(&mut self, device: Device) -> io::Result<()> {
        let name = device.name().unwrap_or("unknown").to_string();
        let tx = self.tx.clone();
        thread::Builder::new()
            .name(format!("capture-{}", self.devices))
            .spawn(move || read_device(device, name, tx))?;
        self.devices += 1;
        Ok(())
    }

    /// Hand an input to the consumer as if a device had reported it at `at`
    pub fn feed(&self, at: Instant, input: RawInput) {
        self.send(Message::Input { at, input });
    }

    pub fn start(&self) {
        self.send(Message::Start(Instant::now()));
    }

    pub fn stop(&self) {
        self.send(Message::Stop(Instant::now()));
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            warn!("recorder thread is gone, input dropped");
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices
    }

    /// Started/stopped announcements, in order
    pub fn notices(&self) -> &Receiver<RecorderNotice> {
        &self.notices
    }

    pub fn is_recording(&self) -> bool {
        self.live.read().recording
    }

    /// Live view of the log being written
    pub fn log(&self) -> SharedLog {
        self.log.clone()
    }

    pub fn status(&self) -> RecorderStatus {
        let live = self.live.read();
        RecorderStatus {
            recording: live.recording,
            total_events: self.log.len(),
            event_counts: live.counts.clone(),
            pressed_keys: live.pressed_keys.clone(),
            pressed_buttons: live.pressed_buttons.clone(),
            duration: self.log.last_timestamp().unwrap_or(0.0),
        }
    }

    /// Drain everything already sent, stop the consumer and hand over the
    /// log. Device threads notice on their next event and exit.
    pub fn finish(mut self) -> crate::log::EventLog {
        self.send(Message::Shutdown);
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                warn!("recorder thread panicked, returning what was logged");
            }
        }
        self.log.take()
    }
}

struct Consumer {
    log: SharedLog,
    live: Arc<RwLock<Live>>,
    notices: Sender<RecorderNotice>,
    toggle_key: Option<KeyIdentifier>,
    normalizer: InputNormalizer,
    started: Option<Instant>,
}

impl Consumer {
    fn run(mut self, rx: Receiver<Message>) {
        for message in rx {
            match message {
                Message::Input { at, input } => self.input(at, input),
                Message::Start(at) => self.start(at),
                Message::Stop(_) => self.stop(),
                Message::Shutdown => break,
            }
        }
        if self.started.is_some() {
            self.stop();
        }
        debug!("recorder thread exiting");
    }

    fn input(&mut self, at: Instant, input: RawInput) {
        if let RawInput::Key { key, action } = input {
            if Some(key) == self.toggle_key {
                if action == KeyAction::Press {
                    match self.started {
                        None => self.start(at),
                        Some(_) => self.stop(),
                    }
                }
                return;
            }
        }

        let Some(started) = self.started else {
            return;
        };
        // Captured before recording began
        let Some(offset) = at.checked_duration_since(started) else {
            return;
        };
        // Streams from different devices may interleave slightly out of order
        let timestamp = match self.log.last_timestamp() {
            Some(last) => offset.as_secs_f64().max(last),
            None => offset.as_secs_f64(),
        };

        let Some(event) = self.normalizer.normalize(timestamp, input) else {
            return;
        };
        let kind = event.kind.type_name();
        match self.log.append(event) {
            Ok(()) => {
                let mut live = self.live.write();
                *live.counts.entry(kind).or_default() += 1;
                live.pressed_keys = self.normalizer.pressed_keys().iter().copied().collect();
                live.pressed_buttons = self.normalizer.pressed_buttons().iter().copied().collect();
            }
            Err(e) => warn!(error = %e, "event rejected by log"),
        }
    }

    fn start(&mut self, at: Instant) {
        if self.started.is_some() {
            return;
        }
        self.log.clear();
        self.normalizer = InputNormalizer::new();
        self.started = Some(at);
        *self.live.write() = Live {
            recording: true,
            ..Live::default()
        };
        info!("recording started");
        let _ = self.notices.send(RecorderNotice::Started);
    }

    fn stop(&mut self) {
        if self.started.take().is_none() {
            return;
        }
        self.live.write().recording = false;
        let events = self.log.len();
        info!(events, "recording stopped");
        let _ = self.notices.send(RecorderNotice::Stopped { events });
    }
}

fn read_device(mut device: Device, name: String, tx: Sender<Message>) {
    let mut translator = Translator::default();
    debug!(device = %name, "capture thread started");
    loop {
        let events = match device.fetch_events() {
            Ok(events) => events,
            Err(e) => {
                warn!(device = %name, error = %e, "device read error, detaching");
                return;
            }
        };
        let at = Instant::now();
        for event in events {
            if let Some(input) = translator.translate(&event) {
                if tx.send(Message::Input { at, input }).is_err() {
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Keyboard,
    Mouse,
    KeyboardMouse,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceKind::Keyboard => "keyboard",
            DeviceKind::Mouse => "mouse",
            DeviceKind::KeyboardMouse => "keyboard+mouse",
        })
    }
}

/// Keyboards report keys, mice report relative axes
pub fn device_kind(device: &Device) -> Option<DeviceKind> {
    let has_keys = device
        .supported_keys()
        .is_some_and(|keys| keys.iter().next().is_some());
    let has_relative = device
        .supported_relative_axes()
        .is_some_and(|axes| axes.iter().next().is_some());
    match (has_keys, has_relative) {
        (true, true) => Some(DeviceKind::KeyboardMouse),
        (true, false) => Some(DeviceKind::Keyboard),
        (false, true) => Some(DeviceKind::Mouse),
        (false, false) => None,
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub kind: Option<DeviceKind>,
}

fn event_nodes(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_event = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with("event"));
        if is_event {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Every `/dev/input/event*` node that can be opened
pub fn list_devices() -> io::Result<Vec<DeviceInfo>> {
    let mut found = Vec::new();
    for path in event_nodes(Path::new("/dev/input"))? {
        match Device::open(&path) {
            Ok(device) => found.push(DeviceInfo {
                name: device.name().unwrap_or("unknown").to_string(),
                kind: device_kind(&device),
                path,
            }),
            Err(e) => debug!(path = %path.display(), error = %e, "skipping device"),
        }
    }
    Ok(found)
}

/// Open every keyboard and mouse. Devices that cannot be opened are skipped.
pub fn discover_devices() -> io::Result<Vec<(DeviceInfo, Device)>> {
    let mut found = Vec::new();
    for path in event_nodes(Path::new("/dev/input"))? {
        let device = match Device::open(&path) {
            Ok(device) => device,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open device");
                continue;
            }
        };
        if let Some(kind) = device_kind(&device) {
            let info = DeviceInfo {
                name: device.name().unwrap_or("unknown").to_string(),
                kind: Some(kind),
                path,
            };
            found.push((info, device));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::key::SpecialKey;
    use evdev::{EventType, KeyCode};
    use std::time::Duration;

    fn key(c: char, action: KeyAction) -> RawInput {
        RawInput::Key {
            key: KeyIdentifier::Char(c),
            action,
        }
    }

    fn f1(action: KeyAction) -> RawInput {
        RawInput::Key {
            key: KeyIdentifier::Special(SpecialKey::F(1)),
            action,
        }
    }

    fn wait_for(recorder: &Recorder, notice: RecorderNotice) {
        let got = recorder
            .notices()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(got, notice);
    }

    #[test]
    fn test_translate_key_and_button() {
        let mut translator = Translator::default();
        let press_w = NativeEvent::new(EventType::KEY.0, KeyCode::KEY_W.0, 1);
        assert_eq!(
            translator.translate(&press_w),
            Some(key('w', KeyAction::Press))
        );
        let repeat_w = NativeEvent::new(EventType::KEY.0, KeyCode::KEY_W.0, 2);
        assert_eq!(
            translator.translate(&repeat_w),
            Some(key('w', KeyAction::Repeat))
        );
        let left = NativeEvent::new(EventType::KEY.0, KeyCode::BTN_LEFT.0, 0);
        assert_eq!(
            translator.translate(&left),
            Some(RawInput::Button {
                button: ButtonId::Left,
                action: KeyAction::Release
            })
        );
    }

    #[test]
    fn test_translate_coalesces_motion_until_sync() {
        let mut translator = Translator::default();
        let rel = |code: RelativeAxisCode, value| {
            NativeEvent::new(EventType::RELATIVE.0, code.0, value)
        };
        let sync = NativeEvent::new(EventType::SYNCHRONIZATION.0, 0, 0);

        assert_eq!(translator.translate(&rel(RelativeAxisCode::REL_X, 3)), None);
        assert_eq!(translator.translate(&rel(RelativeAxisCode::REL_Y, -2)), None);
        assert_eq!(translator.translate(&rel(RelativeAxisCode::REL_X, 1)), None);
        assert_eq!(
            translator.translate(&sync),
            Some(RawInput::Motion { dx: 4, dy: -2 })
        );
        // Nothing pending
        assert_eq!(translator.translate(&sync), None);
        assert_eq!(
            translator.translate(&rel(RelativeAxisCode::REL_WHEEL, -1)),
            Some(RawInput::Scroll { dx: 0, dy: -1 })
        );
    }

    #[test]
    fn test_translate_unknown_key_is_raw() {
        let mut translator = Translator::default();
        let event = NativeEvent::new(EventType::KEY.0, 0x2f0, 1);
        assert_eq!(
            translator.translate(&event),
            Some(RawInput::Key {
                key: KeyIdentifier::Raw(0x2f0),
                action: KeyAction::Press
            })
        );
    }

    #[test]
    fn test_normalizer_debounces_repeat() {
        let mut normalizer = InputNormalizer::new();
        assert!(normalizer.normalize(0.0, key('w', KeyAction::Press)).is_some());
        assert!(normalizer.normalize(0.1, key('w', KeyAction::Repeat)).is_none());
        assert!(normalizer.normalize(0.2, key('w', KeyAction::Press)).is_none());
        assert!(normalizer.normalize(0.3, key('w', KeyAction::Release)).is_some());
        // Release of a key that is not down
        assert!(normalizer.normalize(0.4, key('w', KeyAction::Release)).is_none());
    }

    #[test]
    fn test_normalizer_debounces_buttons() {
        let mut normalizer = InputNormalizer::new();
        let right = |action| RawInput::Button {
            button: ButtonId::Right,
            action,
        };
        // Releasing a button that was never pressed
        assert!(normalizer.normalize(0.0, right(KeyAction::Release)).is_none());

        let events: Vec<InputEvent> = [
            right(KeyAction::Press),
            right(KeyAction::Press),
            right(KeyAction::Repeat),
            right(KeyAction::Release),
            right(KeyAction::Release),
        ]
        .into_iter()
        .enumerate()
        .filter_map(|(i, input)| normalizer.normalize(0.1 * (i + 1) as f64, input))
        .collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].kind,
            EventKind::PointerPress {
                button: ButtonId::Right,
                ..
            }
        ));
        assert!(matches!(
            events[1].kind,
            EventKind::PointerRelease {
                button: ButtonId::Right,
                ..
            }
        ));
        assert!(normalizer.pressed_buttons().is_empty());
    }

    #[test]
    fn test_normalizer_tracks_position() {
        let mut normalizer = InputNormalizer::new();
        normalizer.normalize(0.0, RawInput::Motion { dx: 5, dy: 5 });
        let moved = normalizer.normalize(0.1, RawInput::Motion { dx: -2, dy: 3 }).unwrap();
        assert_eq!(
            moved.kind,
            EventKind::PointerMove {
                x: 3,
                y: 8,
                dx: Some(-2),
                dy: Some(3)
            }
        );
        let pressed = normalizer
            .normalize(
                0.2,
                RawInput::Button {
                    button: ButtonId::Left,
                    action: KeyAction::Press,
                },
            )
            .unwrap();
        assert_eq!(
            pressed.kind,
            EventKind::PointerPress {
                x: 3,
                y: 8,
                button: ButtonId::Left
            }
        );
    }

    #[test]
    fn test_recorder_ignores_input_before_start() {
        let recorder = Recorder::new(None);
        recorder.feed(Instant::now(), key('a', KeyAction::Press));
        recorder.start();
        wait_for(&recorder, RecorderNotice::Started);
        recorder.feed(Instant::now(), key('w', KeyAction::Press));
        recorder.feed(Instant::now(), key('w', KeyAction::Repeat));
        recorder.feed(Instant::now(), key('w', KeyAction::Release));

        let log = recorder.finish();
        let types: Vec<_> = log.iter().map(|e| e.kind.type_name()).collect();
        assert_eq!(types, vec!["key_press", "key_release"]);
    }

    #[test]
    fn test_toggle_key_starts_and_stops_and_is_not_logged() {
        let recorder = Recorder::new(Some(KeyIdentifier::Special(SpecialKey::F(1))));
        let t0 = Instant::now();
        recorder.feed(t0, f1(KeyAction::Press));
        recorder.feed(t0, f1(KeyAction::Release));
        recorder.feed(t0 + Duration::from_millis(100), key('w', KeyAction::Press));
        recorder.feed(t0 + Duration::from_millis(300), key('w', KeyAction::Release));
        recorder.feed(t0 + Duration::from_millis(400), f1(KeyAction::Press));
        recorder.feed(t0 + Duration::from_millis(500), key('x', KeyAction::Press));

        wait_for(&recorder, RecorderNotice::Started);
        wait_for(&recorder, RecorderNotice::Stopped { events: 2 });
        assert!(!recorder.is_recording());

        let log = recorder.finish();
        assert_eq!(log.len(), 2);
        assert!((log.events()[0].timestamp - 0.1).abs() < 1e-9);
        assert!((log.events()[1].timestamp - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_interleaved_streams_stay_ordered() {
        let recorder = Recorder::new(None);
        let t0 = Instant::now();
        recorder.feed(t0, key('q', KeyAction::Press));
        recorder.start();
        wait_for(&recorder, RecorderNotice::Started);
        let now = Instant::now();
        // A second device's report arrives after a later one from the first
        recorder.feed(now + Duration::from_millis(50), key('a', KeyAction::Press));
        recorder.feed(now + Duration::from_millis(40), RawInput::Motion { dx: 1, dy: 0 });

        let log = recorder.finish();
        let stamps: Vec<f64> = log.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] >= stamps[0]);
    }

    #[test]
    fn test_status_while_recording() {
        let recorder = Recorder::new(None);
        recorder.start();
        wait_for(&recorder, RecorderNotice::Started);
        let now = Instant::now();
        recorder.feed(now, key('w', KeyAction::Press));
        recorder.feed(now, RawInput::Motion { dx: 1, dy: 1 });
        recorder.feed(
            now,
            RawInput::Button {
                button: ButtonId::Right,
                action: KeyAction::Press,
            },
        );
        recorder.stop();
        wait_for(&recorder, RecorderNotice::Stopped { events: 3 });

        let status = recorder.status();
        assert!(!status.recording);
        assert_eq!(status.total_events, 3);
        assert_eq!(status.event_counts.get("mouse_move"), Some(&1));
        assert_eq!(status.pressed_keys, vec![KeyIdentifier::Char('w')]);
        assert_eq!(status.pressed_buttons, vec![ButtonId::Right]);
    }
}
