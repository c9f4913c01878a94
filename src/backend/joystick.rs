//! Keyboard and pointer mapped onto two virtual joysticks
//!
//! Device 0 is the right stick (roll, throttle, weapons, aim), device 1 the
//! left stick (strafe). Axis keys deflect an axis while held; pointer motion
//! briefly deflects the aim axes and then recenters them, since a stick has no
//! relative look channel.

use super::{Backend, BackendError, Held, first_error, keep_first};
use crate::config::JoystickConfig;
use crate::key::{ButtonId, KeyIdentifier};
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, EventType, InputEvent as NativeEvent, KeyCode,
    UinputAbsSetup, uinput::VirtualDevice,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::thread;
use std::time::Duration;
use tracing::debug;

pub const DEVICE_COUNT: usize = 2;
pub const MAX_BUTTONS: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    Rx,
    Ry,
    Rz,
}

impl Axis {
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::Rx, Axis::Ry, Axis::Rz];

    pub fn code(self) -> AbsoluteAxisCode {
        match self {
            Axis::X => AbsoluteAxisCode::ABS_X,
            Axis::Y => AbsoluteAxisCode::ABS_Y,
            Axis::Z => AbsoluteAxisCode::ABS_Z,
            Axis::Rx => AbsoluteAxisCode::ABS_RX,
            Axis::Ry => AbsoluteAxisCode::ABS_RY,
            Axis::Rz => AbsoluteAxisCode::ABS_RZ,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// How far a held key pushes its axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deflection {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisBinding {
    pub key: KeyIdentifier,
    pub device: usize,
    pub axis: Axis,
    pub deflection: Deflection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonBinding {
    pub key: KeyIdentifier,
    pub device: usize,
    /// 1-based
    pub button: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerButtonBinding {
    pub button: ButtonId,
    pub device: usize,
    pub joystick_button: u8,
}

/// One virtual stick
pub trait Gamepad {
    fn set_axis(&mut self, axis: Axis, value: i32) -> io::Result<()>;
    fn set_button(&mut self, button: u8, pressed: bool) -> io::Result<()>;
}

fn button_code(button: u8) -> KeyCode {
    KeyCode(KeyCode::BTN_TRIGGER_HAPPY1.0 + u16::from(button.saturating_sub(1)))
}

pub struct UinputGamepad {
    device: VirtualDevice,
}

impl UinputGamepad {
    pub fn open(name: &str, config: &JoystickConfig) -> io::Result<Self> {
        let mut keys = AttributeSet::<KeyCode>::new();
        // BTN_TRIGGER makes the kernel classify the device as a joystick
        keys.insert(KeyCode::BTN_TRIGGER);
        for button in 1..=MAX_BUTTONS {
            keys.insert(button_code(button));
        }

        let info = AbsInfo::new(config.center(), config.axis_min, config.axis_max, 0, 0, 0);
        let mut builder = VirtualDevice::builder()?.name(name).with_keys(&keys)?;
        for axis in Axis::ALL {
            builder = builder.with_absolute_axis(&UinputAbsSetup::new(axis.code(), info))?;
        }
        Ok(Self {
            device: builder.build()?,
        })
    }
}

impl Gamepad for UinputGamepad {
    fn set_axis(&mut self, axis: Axis, value: i32) -> io::Result<()> {
        self.device
            .emit(&[NativeEvent::new(EventType::ABSOLUTE.0, axis.code().0, value)])
    }

    fn set_button(&mut self, button: u8, pressed: bool) -> io::Result<()> {
        self.device.emit(&[NativeEvent::new(
            EventType::KEY.0,
            button_code(button).0,
            i32::from(pressed),
        )])
    }
}

/// Physical resource a held input occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Axis {
        device: usize,
        axis: Axis,
        value: i32,
    },
    Button {
        device: usize,
        button: u8,
    },
}

pub struct DualJoystick<G: Gamepad = UinputGamepad> {
    devices: [G; DEVICE_COUNT],
    axes: [[i32; 6]; DEVICE_COUNT],
    keys: Held<KeyIdentifier, Resource>,
    buttons: Held<ButtonId, Resource>,
    config: JoystickConfig,
    sleep: Box<dyn FnMut(Duration)>,
}

impl DualJoystick<UinputGamepad> {
    pub fn open(config: &JoystickConfig) -> Result<Self, BackendError> {
        let right = UinputGamepad::open(&config.device_names[0], config)
            .map_err(|e| BackendError::unavailable("dual-joystick", e))?;
        let left = UinputGamepad::open(&config.device_names[1], config)
            .map_err(|e| BackendError::unavailable("dual-joystick", e))?;
        let mut joystick = Self::with_devices([right, left], config.clone());
        joystick
            .recenter_all()
            .map_err(|e| BackendError::unavailable("dual-joystick", e))?;
        Ok(joystick)
    }
}

impl<G: Gamepad> DualJoystick<G> {
    pub fn with_devices(devices: [G; DEVICE_COUNT], config: JoystickConfig) -> Self {
        let center = config.center();
        Self {
            devices,
            axes: [[center; 6]; DEVICE_COUNT],
            keys: Held::new(),
            buttons: Held::new(),
            config,
            sleep: Box::new(thread::sleep),
        }
    }

    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn devices(&self) -> &[G; DEVICE_COUNT] {
        &self.devices
    }

    pub fn axis_value(&self, device: usize, axis: Axis) -> i32 {
        self.axes[device][axis.index()]
    }

    fn deflection_value(&self, deflection: Deflection) -> i32 {
        match deflection {
            Deflection::Min => self.config.axis_min,
            Deflection::Max => self.config.axis_max,
        }
    }

    fn resource_for_key(&self, key: &KeyIdentifier) -> Option<Resource> {
        if let Some(b) = self.config.buttons.iter().find(|b| b.key == *key) {
            return Some(Resource::Button {
                device: b.device,
                button: b.button,
            });
        }
        self.config
            .axes
            .iter()
            .find(|a| a.key == *key)
            .map(|a| Resource::Axis {
                device: a.device,
                axis: a.axis,
                value: self.deflection_value(a.deflection),
            })
    }

    fn set_axis(&mut self, device: usize, axis: Axis, value: i32) -> Result<(), BackendError> {
        self.devices[device].set_axis(axis, value)?;
        self.axes[device][axis.index()] = value;
        Ok(())
    }

    /// Value an axis rests at: the deflection of a key still holding it, or center
    fn resting_value(&self, device: usize, axis: Axis) -> i32 {
        self.keys
            .iter()
            .find_map(|(_, resource)| match *resource {
                Resource::Axis {
                    device: d,
                    axis: a,
                    value,
                } if d == device && a == axis => Some(value),
                _ => None,
            })
            .unwrap_or_else(|| self.config.center())
    }

    fn engage(&mut self, resource: Resource) -> Result<(), BackendError> {
        match resource {
            Resource::Axis {
                device,
                axis,
                value,
            } => self.set_axis(device, axis, value),
            Resource::Button { device, button } => {
                self.devices[device].set_button(button, true)?;
                Ok(())
            }
        }
    }

    fn disengage(&mut self, resource: Resource) -> Result<(), BackendError> {
        match resource {
            Resource::Axis { device, axis, .. } => {
                let value = self.resting_value(device, axis);
                self.set_axis(device, axis, value)
            }
            Resource::Button { device, button } => self.release_button(device, button),
        }
    }

    fn aim_deflection(&self, delta: i32) -> i32 {
        let range = f64::from(self.config.axis_max - self.config.axis_min);
        let offset = f64::from(delta) * range / self.config.sensitivity;
        let value = f64::from(self.config.center()) + offset;
        (value.round() as i64).clamp(
            i64::from(self.config.axis_min),
            i64::from(self.config.axis_max),
        ) as i32
    }

    fn recenter_all(&mut self) -> Result<(), BackendError> {
        let center = self.config.center();
        let mut first = None;
        for device in 0..DEVICE_COUNT {
            for axis in Axis::ALL {
                keep_first(&mut first, self.set_axis(device, axis, center));
            }
        }
        first_error(first)
    }

    fn release_button(&mut self, device: usize, button: u8) -> Result<(), BackendError> {
        self.devices[device].set_button(button, false)?;
        Ok(())
    }
}

impl<G: Gamepad> Backend for DualJoystick<G> {
    fn name(&self) -> &'static str {
        "dual-joystick"
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        if self.keys.contains(key) {
            return Ok(());
        }
        let resource = self
            .resource_for_key(key)
            .ok_or(BackendError::UnknownKey(*key))?;
        self.engage(resource)?;
        debug!(key = %key, ?resource, "joystick engaged");
        self.keys.insert(*key, resource);
        Ok(())
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        // Out of the table first so the resting value ignores this key
        let Some(resource) = self.keys.release(key) else {
            return Ok(());
        };
        let result = self.disengage(resource);
        if result.is_err() {
            self.keys.insert(*key, resource);
        }
        result
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        let device = self.config.aim_device;
        let (axis_x, axis_y) = (self.config.aim_axes[0], self.config.aim_axes[1]);

        self.set_axis(device, axis_x, self.aim_deflection(dx))?;
        self.set_axis(device, axis_y, self.aim_deflection(dy))?;
        (self.sleep)(Duration::from_millis(self.config.pulse_ms));

        let rest_x = self.resting_value(device, axis_x);
        let rest_y = self.resting_value(device, axis_y);
        self.set_axis(device, axis_x, rest_x)?;
        self.set_axis(device, axis_y, rest_y)
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        if self.buttons.contains(&button) {
            return Ok(());
        }
        let binding = self
            .config
            .pointer_buttons
            .iter()
            .find(|b| b.button == button)
            .ok_or(BackendError::UnknownButton(button))?;
        let resource = Resource::Button {
            device: binding.device,
            button: binding.joystick_button,
        };
        self.engage(resource)?;
        self.buttons.insert(button, resource);
        Ok(())
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        let Some(&resource) = self.buttons.get(&button) else {
            return Ok(());
        };
        self.disengage(resource)?;
        self.buttons.release(&button);
        Ok(())
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        debug!(dx, dy, "scroll has no joystick mapping, ignoring");
        Ok(())
    }

    fn release_all(&mut self) -> Result<(), BackendError> {
        let mut first = None;
        let mut axis_keys = Vec::new();
        for (key, resource) in self.keys.drain() {
            match resource {
                Resource::Button { device, button } => {
                    let result = self.release_button(device, button);
                    if result.is_err() {
                        self.keys.insert(key, resource);
                    }
                    keep_first(&mut first, result);
                }
                Resource::Axis { .. } => axis_keys.push((key, resource)),
            }
        }
        for (button, resource) in self.buttons.drain() {
            if let Resource::Button { device, button: pad_button } = resource {
                let result = self.release_button(device, pad_button);
                if result.is_err() {
                    self.buttons.insert(button, resource);
                }
                keep_first(&mut first, result);
            }
        }

        let recentered = self.recenter_all();
        if recentered.is_err() {
            // Keys whose axis stayed deflected are still held
            let center = self.config.center();
            for (key, resource) in axis_keys {
                if let Resource::Axis { device, axis, .. } = resource {
                    if self.axis_value(device, axis) != center {
                        self.keys.insert(key, resource);
                    }
                }
            }
        }
        keep_first(&mut first, recentered);
        first_error(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SpecialKey;

    /// Records writes. Refuses the next `button_refusals` button releases and
    /// the next `axis_refusals` writes of `refused_value`.
    #[derive(Debug, Default)]
    struct FakePad {
        axes: Vec<(Axis, i32)>,
        buttons: Vec<(u8, bool)>,
        button_refusals: usize,
        refused_value: i32,
        axis_refusals: usize,
    }

    impl Gamepad for FakePad {
        fn set_axis(&mut self, axis: Axis, value: i32) -> io::Result<()> {
            if value == self.refused_value && self.axis_refusals > 0 {
                self.axis_refusals -= 1;
                return Err(io::Error::other("uinput write failed"));
            }
            self.axes.push((axis, value));
            Ok(())
        }

        fn set_button(&mut self, button: u8, pressed: bool) -> io::Result<()> {
            if !pressed && self.button_refusals > 0 {
                self.button_refusals -= 1;
                return Err(io::Error::other("uinput write failed"));
            }
            self.buttons.push((button, pressed));
            Ok(())
        }
    }

    fn joystick_with(pads: [FakePad; DEVICE_COUNT]) -> DualJoystick<FakePad> {
        DualJoystick::with_devices(pads, JoystickConfig::default()).with_sleep(|_| {})
    }

    fn joystick() -> DualJoystick<FakePad> {
        joystick_with([FakePad::default(), FakePad::default()])
    }

    fn key(c: char) -> KeyIdentifier {
        KeyIdentifier::Char(c)
    }

    #[test]
    fn test_strafe_key_deflects_left_stick_and_recenters() {
        let mut js = joystick();
        let config = JoystickConfig::default();
        js.key_down(&key('a')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.axis_min);
        js.key_up(&key('a')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.center());
        assert_eq!(
            js.devices()[1].axes,
            vec![(Axis::X, config.axis_min), (Axis::X, config.center())]
        );
        assert!(js.devices()[0].axes.is_empty());
    }

    #[test]
    fn test_opposing_keys_restore_still_held_deflection() {
        let mut js = joystick();
        let config = JoystickConfig::default();
        js.key_down(&key('a')).unwrap();
        js.key_down(&key('d')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.axis_max);
        js.key_up(&key('d')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.axis_min);
        js.key_up(&key('a')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.center());
    }

    #[test]
    fn test_button_key_and_double_press() {
        let mut js = joystick();
        let space = KeyIdentifier::Special(SpecialKey::Space);
        js.key_down(&space).unwrap();
        js.key_down(&space).unwrap();
        js.key_up(&space).unwrap();
        js.key_up(&space).unwrap();
        assert_eq!(js.devices()[0].buttons, vec![(1, true), (1, false)]);
    }

    #[test]
    fn test_unmapped_key_is_unknown() {
        let mut js = joystick();
        assert!(matches!(
            js.key_down(&key('z')),
            Err(BackendError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_pointer_pulses_aim_axes_then_recenters() {
        let mut js = joystick();
        let config = JoystickConfig::default();
        js.pointer_move_relative(1_000, -10).unwrap();
        let axes = &js.devices()[0].axes;
        assert_eq!(axes.len(), 4);
        assert_eq!(axes[0], (Axis::X, config.axis_max));
        assert!(axes[1].1 < config.center());
        assert_eq!(axes[2], (Axis::X, config.center()));
        assert_eq!(axes[3], (Axis::Y, config.center()));
    }

    #[test]
    fn test_pointer_buttons_use_dedicated_buttons() {
        let mut js = joystick();
        js.pointer_down(ButtonId::Left).unwrap();
        js.pointer_up(ButtonId::Left).unwrap();
        assert_eq!(js.devices()[0].buttons, vec![(13, true), (13, false)]);
        assert!(matches!(
            js.pointer_down(ButtonId::X2),
            Err(BackendError::UnknownButton(_))
        ));
    }

    #[test]
    fn test_release_all_clears_buttons_and_recenters_both_devices() {
        let mut js = joystick();
        let config = JoystickConfig::default();
        js.key_down(&KeyIdentifier::Special(SpecialKey::Space)).unwrap();
        js.key_down(&key('r')).unwrap();
        js.key_up(&key('r')).unwrap();
        js.key_down(&key('w')).unwrap();
        js.pointer_down(ButtonId::Right).unwrap();

        let before: Vec<usize> = js.devices().iter().map(|d| d.buttons.len()).collect();
        js.release_all().unwrap();

        let releases: Vec<(u8, bool)> = js.devices()[0].buttons[before[0]..].to_vec();
        assert_eq!(releases.len(), 2);
        assert!(releases.contains(&(1, false)));
        assert!(releases.contains(&(14, false)));
        for device in 0..DEVICE_COUNT {
            for axis in Axis::ALL {
                assert_eq!(js.axis_value(device, axis), config.center());
            }
        }

        let after: Vec<usize> = js.devices().iter().map(|d| d.buttons.len()).collect();
        js.release_all().unwrap();
        let again: Vec<usize> = js.devices().iter().map(|d| d.buttons.len()).collect();
        assert_eq!(after, again);
    }

    #[test]
    fn test_failed_button_release_keeps_key_held() {
        let mut js = joystick_with([
            FakePad {
                button_refusals: 1,
                ..FakePad::default()
            },
            FakePad::default(),
        ]);
        let space = KeyIdentifier::Special(SpecialKey::Space);
        js.key_down(&space).unwrap();
        assert!(matches!(js.key_up(&space), Err(BackendError::Io(_))));

        js.release_all().unwrap();
        assert_eq!(js.devices()[0].buttons, vec![(1, true), (1, false)]);
    }

    #[test]
    fn test_failed_release_all_keeps_pointer_button_held() {
        let mut js = joystick_with([
            FakePad {
                button_refusals: 1,
                ..FakePad::default()
            },
            FakePad::default(),
        ]);
        js.pointer_down(ButtonId::Left).unwrap();
        assert!(js.release_all().is_err());

        js.pointer_up(ButtonId::Left).unwrap();
        assert_eq!(js.devices()[0].buttons, vec![(13, true), (13, false)]);
    }

    #[test]
    fn test_failed_recenter_keeps_axis_key_held() {
        let config = JoystickConfig::default();
        let mut js = joystick_with([
            FakePad::default(),
            FakePad {
                refused_value: config.center(),
                axis_refusals: 1,
                ..FakePad::default()
            },
        ]);
        js.key_down(&key('a')).unwrap();
        assert!(js.key_up(&key('a')).is_err());
        assert_eq!(js.axis_value(1, Axis::X), config.axis_min);

        js.key_up(&key('a')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.center());
    }

    #[test]
    fn test_release_all_keeps_axis_key_whose_recenter_failed() {
        let config = JoystickConfig::default();
        let mut js = joystick_with([
            FakePad::default(),
            FakePad {
                refused_value: config.center(),
                axis_refusals: 1,
                ..FakePad::default()
            },
        ]);
        js.key_down(&key('a')).unwrap();
        assert!(js.release_all().is_err());
        assert_eq!(js.axis_value(1, Axis::X), config.axis_min);

        js.key_up(&key('a')).unwrap();
        assert_eq!(js.axis_value(1, Axis::X), config.center());
    }
}
