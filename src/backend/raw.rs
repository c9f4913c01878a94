//! Direct injection through a uinput virtual keyboard and mouse

use super::{Backend, BackendError, Held, first_error, keep_first};
use crate::key::{ButtonId, KeyIdentifier};
use evdev::{
    AttributeSet, EventType, InputEvent as NativeEvent, KeyCode, RelativeAxisCode,
    uinput::VirtualDevice,
};
use std::io;
use tracing::{debug, warn};

const KEY_UP: i32 = 0;
const KEY_DOWN: i32 = 1;

/// Where native events go. A `VirtualDevice` in production, a `Vec` in tests.
pub trait EventSink {
    fn emit(&mut self, events: &[NativeEvent]) -> io::Result<()>;
}

impl EventSink for VirtualDevice {
    fn emit(&mut self, events: &[NativeEvent]) -> io::Result<()> {
        VirtualDevice::emit(self, events)
    }
}

impl EventSink for Vec<NativeEvent> {
    fn emit(&mut self, events: &[NativeEvent]) -> io::Result<()> {
        self.extend_from_slice(events);
        Ok(())
    }
}

pub struct RawBackend<S: EventSink = VirtualDevice> {
    sink: S,
    keys: Held<KeyIdentifier, KeyCode>,
    buttons: Held<ButtonId, KeyCode>,
}

impl RawBackend<VirtualDevice> {
    /// Create the virtual device. Fails when /dev/uinput is missing or not
    /// writable.
    pub fn open(device_name: &str) -> Result<Self, BackendError> {
        Self::create_device(device_name)
            .map(Self::with_sink)
            .map_err(|e| BackendError::unavailable("raw", e))
    }

    fn create_device(device_name: &str) -> io::Result<VirtualDevice> {
        // KEY_MAX is 0x2ff, register every code so raw identifiers replay too
        let mut keys = AttributeSet::<KeyCode>::new();
        for key_code in 0..=0x2ff {
            keys.insert(KeyCode(key_code));
        }

        let mut relative_axes = AttributeSet::<RelativeAxisCode>::new();
        relative_axes.insert(RelativeAxisCode::REL_X);
        relative_axes.insert(RelativeAxisCode::REL_Y);
        relative_axes.insert(RelativeAxisCode::REL_WHEEL);
        relative_axes.insert(RelativeAxisCode::REL_HWHEEL);

        VirtualDevice::builder()?
            .name(device_name)
            .with_keys(&keys)?
            .with_relative_axes(&relative_axes)?
            .build()
    }
}

impl<S: EventSink> RawBackend<S> {
    pub fn with_sink(sink: S) -> Self {
        Self {
            sink,
            keys: Held::new(),
            buttons: Held::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn emit_key(&mut self, code: KeyCode, value: i32) -> Result<(), BackendError> {
        self.sink.emit(&[NativeEvent::new(EventType::KEY.0, code.0, value)])?;
        Ok(())
    }

    fn emit_relative(&mut self, axes: &[(RelativeAxisCode, i32)]) -> Result<(), BackendError> {
        let events: Vec<NativeEvent> = axes
            .iter()
            .filter(|(_, value)| *value != 0)
            .map(|(axis, value)| NativeEvent::new(EventType::RELATIVE.0, axis.0, *value))
            .collect();
        if events.is_empty() {
            return Ok(());
        }
        self.sink.emit(&events)?;
        Ok(())
    }
}

impl<S: EventSink> Backend for RawBackend<S> {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        if self.keys.contains(key) {
            return Ok(());
        }
        let Some(code) = key.key_code() else {
            warn!(key = %key, "no native code for key, skipping");
            return Err(BackendError::UnknownKey(*key));
        };
        self.emit_key(code, KEY_DOWN)?;
        self.keys.insert(*key, code);
        Ok(())
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        let Some(&code) = self.keys.get(key) else {
            debug!(key = %key, "release of key that is not held");
            return Ok(());
        };
        // Stays held until the release actually reached the device
        self.emit_key(code, KEY_UP)?;
        self.keys.release(key);
        Ok(())
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.emit_relative(&[(RelativeAxisCode::REL_X, dx), (RelativeAxisCode::REL_Y, dy)])
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        if self.buttons.contains(&button) {
            return Ok(());
        }
        let code = button.key_code();
        self.emit_key(code, KEY_DOWN)?;
        self.buttons.insert(button, code);
        Ok(())
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        let Some(&code) = self.buttons.get(&button) else {
            return Ok(());
        };
        self.emit_key(code, KEY_UP)?;
        self.buttons.release(&button);
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.emit_relative(&[
            (RelativeAxisCode::REL_WHEEL, dy),
            (RelativeAxisCode::REL_HWHEEL, dx),
        ])
    }

    fn release_all(&mut self) -> Result<(), BackendError> {
        let mut first = None;
        for (key, code) in self.keys.drain() {
            debug!(key = %key, "releasing held key");
            let result = self.emit_key(code, KEY_UP);
            if result.is_err() {
                self.keys.insert(key, code);
            }
            keep_first(&mut first, result);
        }
        for (button, code) in self.buttons.drain() {
            let result = self.emit_key(code, KEY_UP);
            if result.is_err() {
                self.buttons.insert(button, code);
            }
            keep_first(&mut first, result);
        }
        first_error(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SpecialKey;

    fn emitted(backend: &RawBackend<Vec<NativeEvent>>) -> Vec<(u16, u16, i32)> {
        backend
            .sink()
            .iter()
            .map(|e| (e.event_type().0, e.code(), e.value()))
            .collect()
    }

    #[test]
    fn test_key_down_up_emits_native_codes() {
        let mut backend = RawBackend::with_sink(Vec::new());
        let w = KeyIdentifier::Char('w');
        backend.key_down(&w).unwrap();
        backend.key_up(&w).unwrap();
        assert_eq!(
            emitted(&backend),
            vec![
                (EventType::KEY.0, KeyCode::KEY_W.0, 1),
                (EventType::KEY.0, KeyCode::KEY_W.0, 0)
            ]
        );
    }

    #[test]
    fn test_double_press_and_release_are_noops() {
        let mut backend = RawBackend::with_sink(Vec::new());
        let shift = KeyIdentifier::Special(SpecialKey::Shift);
        backend.key_down(&shift).unwrap();
        backend.key_down(&shift).unwrap();
        backend.key_up(&shift).unwrap();
        backend.key_up(&shift).unwrap();
        assert_eq!(emitted(&backend).len(), 2);
    }

    #[test]
    fn test_unknown_key_is_skipped() {
        let mut backend = RawBackend::with_sink(Vec::new());
        let result = backend.key_down(&KeyIdentifier::Char('é'));
        assert!(matches!(result, Err(BackendError::UnknownKey(_))));
        assert!(emitted(&backend).is_empty());
        backend.release_all().unwrap();
        assert!(emitted(&backend).is_empty());
    }

    #[test]
    fn test_release_all_counts() {
        let mut backend = RawBackend::with_sink(Vec::new());
        for c in ['w', 'a', 'd'] {
            backend.key_down(&KeyIdentifier::Char(c)).unwrap();
        }
        backend.key_up(&KeyIdentifier::Char('a')).unwrap();
        backend.pointer_down(ButtonId::Right).unwrap();

        let before = emitted(&backend).len();
        backend.release_all().unwrap();
        let releases = &emitted(&backend)[before..];
        assert_eq!(releases.len(), 3);
        assert!(releases.iter().all(|(_, _, value)| *value == 0));
        assert!(releases.contains(&(EventType::KEY.0, KeyCode::BTN_RIGHT.0, 0)));
    }

    #[test]
    fn test_pointer_and_scroll_use_relative_axes() {
        let mut backend = RawBackend::with_sink(Vec::new());
        backend.pointer_move_relative(5, 0).unwrap();
        backend.pointer_move_relative(0, 0).unwrap();
        backend.scroll(0, -2).unwrap();
        assert_eq!(
            emitted(&backend),
            vec![
                (EventType::RELATIVE.0, RelativeAxisCode::REL_X.0, 5),
                (EventType::RELATIVE.0, RelativeAxisCode::REL_WHEEL.0, -2)
            ]
        );
    }

    /// Records like `Vec`, but refuses the next `fail_releases` key releases
    #[derive(Default)]
    struct FlakySink {
        events: Vec<NativeEvent>,
        fail_releases: usize,
    }

    impl EventSink for FlakySink {
        fn emit(&mut self, events: &[NativeEvent]) -> io::Result<()> {
            let release = events
                .iter()
                .any(|e| e.event_type() == EventType::KEY && e.value() == KEY_UP);
            if release && self.fail_releases > 0 {
                self.fail_releases -= 1;
                return Err(io::Error::other("uinput write failed"));
            }
            self.events.extend_from_slice(events);
            Ok(())
        }
    }

    fn releases_of(sink: &FlakySink, code: KeyCode) -> usize {
        sink.events
            .iter()
            .filter(|e| e.event_type() == EventType::KEY && e.code() == code.0)
            .filter(|e| e.value() == KEY_UP)
            .count()
    }

    #[test]
    fn test_failed_key_up_keeps_key_held() {
        let mut backend = RawBackend::with_sink(FlakySink {
            fail_releases: 1,
            ..FlakySink::default()
        });
        let w = KeyIdentifier::Char('w');
        backend.key_down(&w).unwrap();
        assert!(matches!(backend.key_up(&w), Err(BackendError::Io(_))));

        backend.release_all().unwrap();
        assert_eq!(releases_of(backend.sink(), KeyCode::KEY_W), 1);
    }

    #[test]
    fn test_failed_pointer_up_keeps_button_held() {
        let mut backend = RawBackend::with_sink(FlakySink {
            fail_releases: 1,
            ..FlakySink::default()
        });
        backend.pointer_down(ButtonId::Left).unwrap();
        assert!(backend.pointer_up(ButtonId::Left).is_err());

        backend.pointer_up(ButtonId::Left).unwrap();
        assert_eq!(releases_of(backend.sink(), KeyCode::BTN_LEFT), 1);
        backend.release_all().unwrap();
        assert_eq!(releases_of(backend.sink(), KeyCode::BTN_LEFT), 1);
    }

    #[test]
    fn test_release_all_retries_what_it_could_not_release() {
        let mut backend = RawBackend::with_sink(FlakySink {
            fail_releases: 1,
            ..FlakySink::default()
        });
        let w = KeyIdentifier::Char('w');
        backend.key_down(&w).unwrap();
        backend.pointer_down(ButtonId::Right).unwrap();

        // keys go first, so W is the one refused
        assert!(backend.release_all().is_err());
        assert_eq!(releases_of(backend.sink(), KeyCode::KEY_W), 0);
        assert_eq!(releases_of(backend.sink(), KeyCode::BTN_RIGHT), 1);

        backend.release_all().unwrap();
        assert_eq!(releases_of(backend.sink(), KeyCode::KEY_W), 1);
        assert_eq!(releases_of(backend.sink(), KeyCode::BTN_RIGHT), 1);
    }

    #[test]
    fn test_raw_identifier_injects_its_code() {
        let mut backend = RawBackend::with_sink(Vec::new());
        backend.key_down(&KeyIdentifier::Raw(148)).unwrap();
        assert_eq!(emitted(&backend), vec![(EventType::KEY.0, 148, 1)]);
    }
}
