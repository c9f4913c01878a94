//! Least capable backend, built on enigo's cross-platform simulation

use super::{Backend, BackendError, Held, first_error, keep_first};
use crate::key::{ButtonId, KeyIdentifier, SpecialKey};
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use tracing::warn;

/// The simulation calls the backend makes. `Enigo` in production, a
/// recording fake in tests.
pub trait Simulator {
    fn key(&mut self, key: Key, direction: Direction) -> Result<(), BackendError>;
    fn button(&mut self, button: Button, direction: Direction) -> Result<(), BackendError>;
    fn move_by(&mut self, dx: i32, dy: i32) -> Result<(), BackendError>;
    fn scroll(&mut self, length: i32, axis: Axis) -> Result<(), BackendError>;
}

impl Simulator for Enigo {
    fn key(&mut self, key: Key, direction: Direction) -> Result<(), BackendError> {
        Keyboard::key(self, key, direction).map_err(injection)
    }

    fn button(&mut self, button: Button, direction: Direction) -> Result<(), BackendError> {
        Mouse::button(self, button, direction).map_err(injection)
    }

    fn move_by(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.move_mouse(dx, dy, Coordinate::Rel).map_err(injection)
    }

    fn scroll(&mut self, length: i32, axis: Axis) -> Result<(), BackendError> {
        Mouse::scroll(self, length, axis).map_err(injection)
    }
}

pub struct FallbackBackend<S: Simulator = Enigo> {
    simulator: S,
    keys: Held<KeyIdentifier, Key>,
    buttons: Held<ButtonId, Button>,
}

fn injection(e: impl std::fmt::Display) -> BackendError {
    BackendError::Injection(e.to_string())
}

/// enigo key for an identifier. Only keys enigo offers on every platform.
pub fn convert_key(key: &KeyIdentifier) -> Option<Key> {
    let special = match key {
        KeyIdentifier::Char(c) => return Some(Key::Unicode(*c)),
        KeyIdentifier::Raw(_) => return None,
        KeyIdentifier::Special(special) => *special,
    };
    let converted = match special {
        SpecialKey::Space => Key::Space,
        SpecialKey::Enter => Key::Return,
        SpecialKey::Tab => Key::Tab,
        SpecialKey::Esc => Key::Escape,
        SpecialKey::Backspace => Key::Backspace,
        SpecialKey::Delete => Key::Delete,
        SpecialKey::Home => Key::Home,
        SpecialKey::End => Key::End,
        SpecialKey::PageUp => Key::PageUp,
        SpecialKey::PageDown => Key::PageDown,
        SpecialKey::Up => Key::UpArrow,
        SpecialKey::Down => Key::DownArrow,
        SpecialKey::Left => Key::LeftArrow,
        SpecialKey::Right => Key::RightArrow,
        SpecialKey::CapsLock => Key::CapsLock,
        SpecialKey::Shift | SpecialKey::ShiftR => Key::Shift,
        SpecialKey::Ctrl | SpecialKey::CtrlR => Key::Control,
        SpecialKey::Alt | SpecialKey::AltR => Key::Alt,
        SpecialKey::Cmd | SpecialKey::CmdR => Key::Meta,
        SpecialKey::F(n) => match n {
            1 => Key::F1,
            2 => Key::F2,
            3 => Key::F3,
            4 => Key::F4,
            5 => Key::F5,
            6 => Key::F6,
            7 => Key::F7,
            8 => Key::F8,
            9 => Key::F9,
            10 => Key::F10,
            11 => Key::F11,
            12 => Key::F12,
            _ => return None,
        },
        SpecialKey::Insert
        | SpecialKey::NumLock
        | SpecialKey::ScrollLock
        | SpecialKey::PrintScreen
        | SpecialKey::Pause
        | SpecialKey::Menu => return None,
    };
    Some(converted)
}

pub fn convert_button(button: ButtonId) -> Option<Button> {
    match button {
        ButtonId::Left => Some(Button::Left),
        ButtonId::Right => Some(Button::Right),
        ButtonId::Middle => Some(Button::Middle),
        ButtonId::X1 => Some(Button::Back),
        ButtonId::X2 => Some(Button::Forward),
        ButtonId::Raw(_) => None,
    }
}

impl FallbackBackend<Enigo> {
    pub fn new() -> Result<Self, BackendError> {
        let enigo =
            Enigo::new(&Settings::default()).map_err(|e| BackendError::unavailable("fallback", e))?;
        Ok(Self::with_simulator(enigo))
    }
}

impl<S: Simulator> FallbackBackend<S> {
    pub fn with_simulator(simulator: S) -> Self {
        Self {
            simulator,
            keys: Held::new(),
            buttons: Held::new(),
        }
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }
}

impl<S: Simulator> Backend for FallbackBackend<S> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        if self.keys.contains(key) {
            return Ok(());
        }
        let Some(converted) = convert_key(key) else {
            warn!(key = %key, "fallback backend cannot inject key, skipping");
            return Err(BackendError::UnknownKey(*key));
        };
        self.simulator.key(converted, Direction::Press)?;
        self.keys.insert(*key, converted);
        Ok(())
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        let Some(&converted) = self.keys.get(key) else {
            return Ok(());
        };
        self.simulator.key(converted, Direction::Release)?;
        self.keys.release(key);
        Ok(())
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        self.simulator.move_by(dx, dy)
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        if self.buttons.contains(&button) {
            return Ok(());
        }
        let converted = convert_button(button).ok_or(BackendError::UnknownButton(button))?;
        self.simulator.button(converted, Direction::Press)?;
        self.buttons.insert(button, converted);
        Ok(())
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        let Some(&converted) = self.buttons.get(&button) else {
            return Ok(());
        };
        self.simulator.button(converted, Direction::Release)?;
        self.buttons.release(&button);
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        // enigo scrolls down for positive lengths
        if dy != 0 {
            self.simulator.scroll(-dy, Axis::Vertical)?;
        }
        if dx != 0 {
            self.simulator.scroll(dx, Axis::Horizontal)?;
        }
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), BackendError> {
        let mut first = None;
        for (id, key) in self.keys.drain() {
            let result = self.simulator.key(key, Direction::Release);
            if result.is_err() {
                self.keys.insert(id, key);
            }
            keep_first(&mut first, result);
        }
        for (id, button) in self.buttons.drain() {
            let result = self.simulator.button(button, Direction::Release);
            if result.is_err() {
                self.buttons.insert(id, button);
            }
            keep_first(&mut first, result);
        }
        first_error(first)
    }
}
