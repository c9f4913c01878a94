//! Typed key and pointer-button identifiers
//!
//! Canonical text forms:
//!   w  1  ;         printable keys, lowercase
//!   Key.space       named special keys
//!   Key.raw_148     native key codes without a name
//!   left  x1        pointer buttons
//!   raw_279         native button codes without a name

use evdev::KeyCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SPECIAL_PREFIX: &str = "Key.";
const RAW_PREFIX: &str = "raw_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseKeyError {
    #[error("empty key identifier")]
    Empty,
    #[error("unknown special key: {0}")]
    UnknownSpecial(String),
    #[error("unknown pointer button: {0}")]
    UnknownButton(String),
    #[error("invalid key identifier: {0:?}")]
    Invalid(String),
}

/// Named non-printable keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpecialKey {
    Space,
    Enter,
    Tab,
    Esc,
    Backspace,
    Delete,
    Insert,
    Home,
    End,
    PageUp,
    PageDown,
    Up,
    Down,
    Left,
    Right,
    CapsLock,
    NumLock,
    ScrollLock,
    PrintScreen,
    Pause,
    Menu,
    Shift,
    ShiftR,
    Ctrl,
    CtrlR,
    Alt,
    AltR,
    Cmd,
    CmdR,
    /// Function keys F1..=F24
    F(u8),
}

const SPECIAL_KEYS: &[(SpecialKey, &str, KeyCode)] = &[
    (SpecialKey::Space, "space", KeyCode::KEY_SPACE),
    (SpecialKey::Enter, "enter", KeyCode::KEY_ENTER),
    (SpecialKey::Tab, "tab", KeyCode::KEY_TAB),
    (SpecialKey::Esc, "esc", KeyCode::KEY_ESC),
    (SpecialKey::Backspace, "backspace", KeyCode::KEY_BACKSPACE),
    (SpecialKey::Delete, "delete", KeyCode::KEY_DELETE),
    (SpecialKey::Insert, "insert", KeyCode::KEY_INSERT),
    (SpecialKey::Home, "home", KeyCode::KEY_HOME),
    (SpecialKey::End, "end", KeyCode::KEY_END),
    (SpecialKey::PageUp, "page_up", KeyCode::KEY_PAGEUP),
    (SpecialKey::PageDown, "page_down", KeyCode::KEY_PAGEDOWN),
    (SpecialKey::Up, "up", KeyCode::KEY_UP),
    (SpecialKey::Down, "down", KeyCode::KEY_DOWN),
    (SpecialKey::Left, "left", KeyCode::KEY_LEFT),
    (SpecialKey::Right, "right", KeyCode::KEY_RIGHT),
    (SpecialKey::CapsLock, "caps_lock", KeyCode::KEY_CAPSLOCK),
    (SpecialKey::NumLock, "num_lock", KeyCode::KEY_NUMLOCK),
    (SpecialKey::ScrollLock, "scroll_lock", KeyCode::KEY_SCROLLLOCK),
    (SpecialKey::PrintScreen, "print_screen", KeyCode::KEY_SYSRQ),
    (SpecialKey::Pause, "pause", KeyCode::KEY_PAUSE),
    (SpecialKey::Menu, "menu", KeyCode::KEY_COMPOSE),
    (SpecialKey::Shift, "shift", KeyCode::KEY_LEFTSHIFT),
    (SpecialKey::ShiftR, "shift_r", KeyCode::KEY_RIGHTSHIFT),
    (SpecialKey::Ctrl, "ctrl", KeyCode::KEY_LEFTCTRL),
    (SpecialKey::CtrlR, "ctrl_r", KeyCode::KEY_RIGHTCTRL),
    (SpecialKey::Alt, "alt", KeyCode::KEY_LEFTALT),
    (SpecialKey::AltR, "alt_r", KeyCode::KEY_RIGHTALT),
    (SpecialKey::Cmd, "cmd", KeyCode::KEY_LEFTMETA),
    (SpecialKey::CmdR, "cmd_r", KeyCode::KEY_RIGHTMETA),
];

/// Accepted on parse, never rendered
const SPECIAL_ALIASES: &[(&str, SpecialKey)] = &[
    ("shift_l", SpecialKey::Shift),
    ("ctrl_l", SpecialKey::Ctrl),
    ("alt_l", SpecialKey::Alt),
    ("alt_gr", SpecialKey::AltR),
    ("cmd_l", SpecialKey::Cmd),
    ("return", SpecialKey::Enter),
    ("escape", SpecialKey::Esc),
];

const FUNCTION_KEYS: [KeyCode; 24] = [
    KeyCode::KEY_F1,
    KeyCode::KEY_F2,
    KeyCode::KEY_F3,
    KeyCode::KEY_F4,
    KeyCode::KEY_F5,
    KeyCode::KEY_F6,
    KeyCode::KEY_F7,
    KeyCode::KEY_F8,
    KeyCode::KEY_F9,
    KeyCode::KEY_F10,
    KeyCode::KEY_F11,
    KeyCode::KEY_F12,
    KeyCode::KEY_F13,
    KeyCode::KEY_F14,
    KeyCode::KEY_F15,
    KeyCode::KEY_F16,
    KeyCode::KEY_F17,
    KeyCode::KEY_F18,
    KeyCode::KEY_F19,
    KeyCode::KEY_F20,
    KeyCode::KEY_F21,
    KeyCode::KEY_F22,
    KeyCode::KEY_F23,
    KeyCode::KEY_F24,
];

/// US QWERTY printable keys
const PRINTABLE_KEYS: &[(char, KeyCode)] = &[
    ('a', KeyCode::KEY_A),
    ('b', KeyCode::KEY_B),
    ('c', KeyCode::KEY_C),
    ('d', KeyCode::KEY_D),
    ('e', KeyCode::KEY_E),
    ('f', KeyCode::KEY_F),
    ('g', KeyCode::KEY_G),
    ('h', KeyCode::KEY_H),
    ('i', KeyCode::KEY_I),
    ('j', KeyCode::KEY_J),
    ('k', KeyCode::KEY_K),
    ('l', KeyCode::KEY_L),
    ('m', KeyCode::KEY_M),
    ('n', KeyCode::KEY_N),
    ('o', KeyCode::KEY_O),
    ('p', KeyCode::KEY_P),
    ('q', KeyCode::KEY_Q),
    ('r', KeyCode::KEY_R),
    ('s', KeyCode::KEY_S),
    ('t', KeyCode::KEY_T),
    ('u', KeyCode::KEY_U),
    ('v', KeyCode::KEY_V),
    ('w', KeyCode::KEY_W),
    ('x', KeyCode::KEY_X),
    ('y', KeyCode::KEY_Y),
    ('z', KeyCode::KEY_Z),
    ('1', KeyCode::KEY_1),
    ('2', KeyCode::KEY_2),
    ('3', KeyCode::KEY_3),
    ('4', KeyCode::KEY_4),
    ('5', KeyCode::KEY_5),
    ('6', KeyCode::KEY_6),
    ('7', KeyCode::KEY_7),
    ('8', KeyCode::KEY_8),
    ('9', KeyCode::KEY_9),
    ('0', KeyCode::KEY_0),
    ('-', KeyCode::KEY_MINUS),
    ('=', KeyCode::KEY_EQUAL),
    ('[', KeyCode::KEY_LEFTBRACE),
    (']', KeyCode::KEY_RIGHTBRACE),
    (';', KeyCode::KEY_SEMICOLON),
    ('\'', KeyCode::KEY_APOSTROPHE),
    ('`', KeyCode::KEY_GRAVE),
    ('\\', KeyCode::KEY_BACKSLASH),
    (',', KeyCode::KEY_COMMA),
    ('.', KeyCode::KEY_DOT),
    ('/', KeyCode::KEY_SLASH),
];

impl SpecialKey {
    pub fn key_code(self) -> Option<KeyCode> {
        match self {
            SpecialKey::F(n) => FUNCTION_KEYS.get(usize::from(n).checked_sub(1)?).copied(),
            other => SPECIAL_KEYS
                .iter()
                .find(|(key, _, _)| *key == other)
                .map(|(_, _, code)| *code),
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            return (1..=24).contains(&n).then_some(SpecialKey::F(n));
        }
        SPECIAL_KEYS
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(key, _, _)| *key)
            .or_else(|| {
                SPECIAL_ALIASES
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, key)| *key)
            })
    }
}

impl fmt::Display for SpecialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let SpecialKey::F(n) = self {
            return write!(f, "f{}", n);
        }
        let name = SPECIAL_KEYS
            .iter()
            .find(|(key, _, _)| key == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown");
        f.write_str(name)
    }
}

/// A keyboard key, independent of how it was captured or will be injected.
///
/// Equality is equality of the canonical text form, so a key parsed from a
/// session file compares equal to the same key captured live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyIdentifier {
    Char(char),
    Special(SpecialKey),
    /// Native code with no canonical name
    Raw(u16),
}

impl KeyIdentifier {
    /// Identify an evdev key code. Never fails: unnamed codes become `Raw`.
    pub fn from_key_code(code: KeyCode) -> Self {
        if let Some((c, _)) = PRINTABLE_KEYS.iter().find(|(_, k)| *k == code) {
            return KeyIdentifier::Char(*c);
        }
        if let Some((key, _, _)) = SPECIAL_KEYS.iter().find(|(_, _, k)| *k == code) {
            return KeyIdentifier::Special(*key);
        }
        if let Some(idx) = FUNCTION_KEYS.iter().position(|k| *k == code) {
            return KeyIdentifier::Special(SpecialKey::F(idx as u8 + 1));
        }
        KeyIdentifier::Raw(code.0)
    }

    /// The evdev code to inject for this key, if there is one
    pub fn key_code(&self) -> Option<KeyCode> {
        match self {
            KeyIdentifier::Char(c) => PRINTABLE_KEYS
                .iter()
                .find(|(ch, _)| ch == c)
                .map(|(_, code)| *code),
            KeyIdentifier::Special(key) => key.key_code(),
            KeyIdentifier::Raw(code) => Some(KeyCode(*code)),
        }
    }

    /// Lowercase name used by binding tables: the character itself, or the
    /// special key name without its namespace.
    pub fn short_name(&self) -> String {
        match self {
            KeyIdentifier::Char(c) => c.to_string(),
            KeyIdentifier::Special(key) => key.to_string(),
            KeyIdentifier::Raw(code) => format!("{}{}", RAW_PREFIX, code),
        }
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyIdentifier::Char(c) => write!(f, "{}", c),
            KeyIdentifier::Special(key) => write!(f, "{}{}", SPECIAL_PREFIX, key),
            KeyIdentifier::Raw(code) => write!(f, "{}{}{}", SPECIAL_PREFIX, RAW_PREFIX, code),
        }
    }
}

impl FromStr for KeyIdentifier {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseKeyError::Empty);
        }

        if let Some(name) = s.strip_prefix(SPECIAL_PREFIX) {
            if let Some(code) = name.strip_prefix(RAW_PREFIX) {
                return code
                    .parse::<u16>()
                    .map(|n| KeyIdentifier::from_key_code(KeyCode(n)))
                    .map_err(|_| ParseKeyError::Invalid(s.to_string()));
            }
            return SpecialKey::from_name(&name.to_ascii_lowercase())
                .map(KeyIdentifier::Special)
                .ok_or_else(|| ParseKeyError::UnknownSpecial(name.to_string()));
        }

        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if !c.is_whitespace() && !c.is_control() => {
                Ok(KeyIdentifier::Char(c.to_ascii_lowercase()))
            }
            _ => Err(ParseKeyError::Invalid(s.to_string())),
        }
    }
}

impl TryFrom<String> for KeyIdentifier {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyIdentifier> for String {
    fn from(key: KeyIdentifier) -> Self {
        key.to_string()
    }
}

/// A pointer button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ButtonId {
    Left,
    Right,
    Middle,
    X1,
    X2,
    Raw(u16),
}

const BUTTONS: &[(ButtonId, &str, KeyCode)] = &[
    (ButtonId::Left, "left", KeyCode::BTN_LEFT),
    (ButtonId::Right, "right", KeyCode::BTN_RIGHT),
    (ButtonId::Middle, "middle", KeyCode::BTN_MIDDLE),
    (ButtonId::X1, "x1", KeyCode::BTN_SIDE),
    (ButtonId::X2, "x2", KeyCode::BTN_EXTRA),
];

impl ButtonId {
    /// Whether an evdev key code is a mouse button (BTN_LEFT..=BTN_TASK)
    pub fn is_pointer_button(code: KeyCode) -> bool {
        (KeyCode::BTN_LEFT.0..=KeyCode::BTN_TASK.0).contains(&code.0)
    }

    pub fn from_key_code(code: KeyCode) -> Self {
        BUTTONS
            .iter()
            .find(|(_, _, k)| *k == code)
            .map(|(button, _, _)| *button)
            .unwrap_or(ButtonId::Raw(code.0))
    }

    pub fn key_code(&self) -> KeyCode {
        match self {
            ButtonId::Raw(code) => KeyCode(*code),
            named => BUTTONS
                .iter()
                .find(|(button, _, _)| button == named)
                .map(|(_, _, code)| *code)
                .unwrap_or(KeyCode::BTN_LEFT),
        }
    }
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let ButtonId::Raw(code) = self {
            return write!(f, "{}{}", RAW_PREFIX, code);
        }
        let name = BUTTONS
            .iter()
            .find(|(button, _, _)| button == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown");
        f.write_str(name)
    }
}

impl FromStr for ButtonId {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseKeyError::Empty);
        }
        if let Some(code) = s.strip_prefix(RAW_PREFIX) {
            return code
                .parse::<u16>()
                .map(|n| ButtonId::from_key_code(KeyCode(n)))
                .map_err(|_| ParseKeyError::UnknownButton(s.to_string()));
        }
        let lower = s.to_ascii_lowercase();
        BUTTONS
            .iter()
            .find(|(_, name, _)| *name == lower)
            .map(|(button, _, _)| *button)
            .ok_or_else(|| ParseKeyError::UnknownButton(s.to_string()))
    }
}

impl TryFrom<String> for ButtonId {
    type Error = ParseKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ButtonId> for String {
    fn from(button: ButtonId) -> Self {
        button.to_string()
    }
}
