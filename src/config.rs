//! TOML configuration
//!
//! Every section is optional; missing values take their defaults.
//!
//! ```toml
//! [recording]
//! fps = 30
//! toggle_key = "Key.f1"
//!
//! [replay]
//! mode = "human"
//! speed = 1.0
//!
//! [[joystick.axes]]
//! key = "w"
//! device = 1
//! axis = "y"
//! deflection = "min"
//! ```

use crate::backend::BackendMode;
use crate::backend::joystick::{
    Axis, AxisBinding, ButtonBinding, DEVICE_COUNT, Deflection, MAX_BUTTONS, PointerButtonBinding,
};
use crate::frame::DEFAULT_QUEUE_CAPACITY;
use crate::key::{ButtonId, KeyIdentifier, SpecialKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "replaykit.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recording: RecordingConfig,
    pub replay: ReplayConfig,
    pub humanize: HumanizeConfig,
    pub joystick: JoystickConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Rate of the frame-aligned input sequence
    pub fps: u32,
    /// Starts and stops recording; never recorded itself
    pub toggle_key: KeyIdentifier,
    pub output_dir: PathBuf,
    /// Passed through to session metadata for the video collaborator
    pub resolution: Option<(u32, u32)>,
    pub video_codec: String,
    pub frame_queue_capacity: usize,
    pub status_interval_secs: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            toggle_key: KeyIdentifier::Special(SpecialKey::F(1)),
            output_dir: PathBuf::from("recordings"),
            resolution: Some((1280, 720)),
            video_codec: "libx264".to_string(),
            frame_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            status_interval_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub speed: f64,
    pub start_delay_secs: f64,
    pub mode: BackendMode,
    /// Pressing this on a physical keyboard cancels a running replay
    pub stop_key: KeyIdentifier,
    pub progress_every: usize,
    pub device_name: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            start_delay_secs: 3.0,
            mode: BackendMode::Human,
            stop_key: KeyIdentifier::Special(SpecialKey::F(1)),
            progress_every: 100,
            device_name: "replaykit-playback".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanizeConfig {
    pub pause_min_ms: f64,
    pub pause_max_ms: f64,
    /// Per sub-move noise, uniform in ±jitter_px
    pub jitter_px: f64,
    /// Pixels of travel per sub-move
    pub step_px: f64,
    pub max_steps: u32,
    pub step_sleep_min_ms: f64,
    pub step_sleep_max_ms: f64,
    pub step_sleep_cap_ms: f64,
}

impl Default for HumanizeConfig {
    fn default() -> Self {
        Self {
            pause_min_ms: 10.0,
            pause_max_ms: 40.0,
            jitter_px: 1.5,
            step_px: 15.0,
            max_steps: 20,
            step_sleep_min_ms: 1.0,
            step_sleep_max_ms: 5.0,
            step_sleep_cap_ms: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoystickConfig {
    pub axis_min: i32,
    pub axis_max: i32,
    /// Pixels of pointer travel that sweep the full axis range
    pub sensitivity: f64,
    pub pulse_ms: u64,
    /// Right stick first, then left stick
    pub device_names: [String; DEVICE_COUNT],
    pub aim_device: usize,
    pub aim_axes: [Axis; 2],
    pub axes: Vec<AxisBinding>,
    pub buttons: Vec<ButtonBinding>,
    pub pointer_buttons: Vec<PointerButtonBinding>,
}

const RIGHT_STICK: usize = 0;
const LEFT_STICK: usize = 1;

fn char_key(c: char) -> KeyIdentifier {
    KeyIdentifier::Char(c)
}

fn special(key: SpecialKey) -> KeyIdentifier {
    KeyIdentifier::Special(key)
}

fn axis(key: KeyIdentifier, device: usize, axis: Axis, deflection: Deflection) -> AxisBinding {
    AxisBinding {
        key,
        device,
        axis,
        deflection,
    }
}

impl Default for JoystickConfig {
    fn default() -> Self {
        let buttons = [
            special(SpecialKey::Space),
            char_key('r'),
            char_key('t'),
            char_key('f'),
            char_key('g'),
            char_key('n'),
            char_key('v'),
            special(SpecialKey::Tab),
            char_key('x'),
            char_key('c'),
            special(SpecialKey::Enter),
            special(SpecialKey::Esc),
        ]
        .into_iter()
        .zip(1u8..)
        .map(|(key, button)| ButtonBinding {
            key,
            device: RIGHT_STICK,
            button,
        })
        .collect();

        let pointer_buttons = [ButtonId::Left, ButtonId::Right, ButtonId::Middle]
            .into_iter()
            .zip(13u8..)
            .map(|(button, joystick_button)| PointerButtonBinding {
                button,
                device: RIGHT_STICK,
                joystick_button,
            })
            .collect();

        Self {
            axis_min: 0,
            axis_max: 32767,
            sensitivity: 100.0,
            pulse_ms: 30,
            device_names: [
                "replaykit-right-stick".to_string(),
                "replaykit-left-stick".to_string(),
            ],
            aim_device: RIGHT_STICK,
            aim_axes: [Axis::X, Axis::Y],
            axes: vec![
                // strafe
                axis(char_key('w'), LEFT_STICK, Axis::Y, Deflection::Min),
                axis(char_key('s'), LEFT_STICK, Axis::Y, Deflection::Max),
                axis(char_key('a'), LEFT_STICK, Axis::X, Deflection::Min),
                axis(char_key('d'), LEFT_STICK, Axis::X, Deflection::Max),
                // roll
                axis(char_key('q'), RIGHT_STICK, Axis::Rz, Deflection::Min),
                axis(char_key('e'), RIGHT_STICK, Axis::Rz, Deflection::Max),
                // throttle
                axis(special(SpecialKey::Shift), RIGHT_STICK, Axis::Z, Deflection::Max),
                axis(special(SpecialKey::Ctrl), RIGHT_STICK, Axis::Z, Deflection::Min),
            ],
            buttons,
            pointer_buttons,
        }
    }
}

impl JoystickConfig {
    pub fn center(&self) -> i32 {
        self.axis_min + (self.axis_max - self.axis_min + 1) / 2
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.axis_min >= self.axis_max {
            return Err(ConfigError::Invalid(format!(
                "joystick axis_min {} must be below axis_max {}",
                self.axis_min, self.axis_max
            )));
        }
        if !(self.sensitivity > 0.0) {
            return Err(ConfigError::Invalid("joystick sensitivity must be positive".into()));
        }
        let devices = self
            .axes
            .iter()
            .map(|a| a.device)
            .chain(self.buttons.iter().map(|b| b.device))
            .chain(self.pointer_buttons.iter().map(|b| b.device))
            .chain(std::iter::once(self.aim_device));
        for device in devices {
            if device >= DEVICE_COUNT {
                return Err(ConfigError::Invalid(format!(
                    "joystick device index {} out of range (0..{})",
                    device, DEVICE_COUNT
                )));
            }
        }
        let buttons = self
            .buttons
            .iter()
            .map(|b| b.button)
            .chain(self.pointer_buttons.iter().map(|b| b.joystick_button));
        for button in buttons {
            if !(1..=MAX_BUTTONS).contains(&button) {
                return Err(ConfigError::Invalid(format!(
                    "joystick button {} out of range (1..={})",
                    button, MAX_BUTTONS
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but a missing file means defaults
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recording.fps == 0 {
            return Err(ConfigError::Invalid("recording fps must be positive".into()));
        }
        if !(self.replay.speed > 0.0 && self.replay.speed.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "replay speed must be positive, got {}",
                self.replay.speed
            )));
        }
        if !(self.replay.start_delay_secs >= 0.0 && self.replay.start_delay_secs.is_finite()) {
            return Err(ConfigError::Invalid(
                "replay start delay must be finite and not negative".into(),
            ));
        }
        let h = &self.humanize;
        let values = [
            ("pause_min_ms", h.pause_min_ms),
            ("pause_max_ms", h.pause_max_ms),
            ("jitter_px", h.jitter_px),
            ("step_px", h.step_px),
            ("step_sleep_min_ms", h.step_sleep_min_ms),
            ("step_sleep_max_ms", h.step_sleep_max_ms),
            ("step_sleep_cap_ms", h.step_sleep_cap_ms),
        ];
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "humanize {} must be finite, got {}",
                name, value
            )));
        }
        if h.step_sleep_cap_ms < 0.0 {
            return Err(ConfigError::Invalid(
                "humanize step_sleep_cap_ms must not be negative".into(),
            ));
        }
        if h.pause_min_ms < 0.0 || h.pause_min_ms > h.pause_max_ms {
            return Err(ConfigError::Invalid(
                "humanize pause bounds must satisfy 0 <= min <= max".into(),
            ));
        }
        if h.step_sleep_min_ms < 0.0 || h.step_sleep_min_ms > h.step_sleep_max_ms {
            return Err(ConfigError::Invalid(
                "humanize step sleep bounds must satisfy 0 <= min <= max".into(),
            ));
        }
        if !(h.step_px > 0.0) || h.jitter_px < 0.0 {
            return Err(ConfigError::Invalid(
                "humanize step_px must be positive and jitter_px not negative".into(),
            ));
        }
        self.joystick.validate()
    }
}
