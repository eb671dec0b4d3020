//! Pure gamepad normalization: axis/trigger value scaling, button/axis
//! remapping, and the name-keyed configuration table.
//!
//! Configuration lookup is by name with fallback to a standard XPad-style
//! layout; a USB vendor/product keying scheme was considered but only one
//! layout is ever wired up at runtime, so no unreachable branches are kept.

use std::collections::HashMap;

pub const ABS_MIN: i32 = -32767;
pub const ABS_MAX: i32 = 32767;
pub const MAX_BTNS: usize = 512;
pub const MAX_AXES: usize = 64;

/// Linux input event-code constants used by the standard layout below.
mod evcodes {
    pub const BTN_A: u16 = 0x130;
    pub const BTN_B: u16 = 0x131;
    pub const BTN_X: u16 = 0x133;
    pub const BTN_Y: u16 = 0x134;
    pub const BTN_TL: u16 = 0x136;
    pub const BTN_TR: u16 = 0x137;
    pub const BTN_SELECT: u16 = 0x13A;
    pub const BTN_START: u16 = 0x13B;
    pub const BTN_MODE: u16 = 0x13C;
    pub const BTN_THUMBL: u16 = 0x13D;
    pub const BTN_THUMBR: u16 = 0x13E;

    pub const ABS_X: u16 = 0x00;
    pub const ABS_Y: u16 = 0x01;
    pub const ABS_Z: u16 = 0x02;
    pub const ABS_RX: u16 = 0x03;
    pub const ABS_RY: u16 = 0x04;
    pub const ABS_RZ: u16 = 0x05;
    pub const ABS_HAT0X: u16 = 0x10;
    pub const ABS_HAT0Y: u16 = 0x11;
}

/// Axis-to-button remap entries with an optional sign for two-element
/// mappings (first element → positive direction, second → negative).
#[derive(Debug, Clone)]
pub struct AxisToBtn {
    pub axis: u8,
    pub buttons: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GamepadConfig {
    pub name: &'static str,
    pub btn_map: Vec<u16>,
    pub axes_map: Vec<u16>,
    pub axes_to_btn: Vec<AxisToBtn>,
    pub axis_remap: HashMap<u8, u8>,
    pub btn_remap: HashMap<u8, u8>,
    pub trigger_axes: Vec<u8>,
}

/// The standard Xbox-360-style layout: 11 mapped buttons, 8 axes, used both
/// as the direct config for recognised names and as the unrecognized-name
/// fallback.
pub fn standard_xpad_config() -> GamepadConfig {
    use evcodes::*;
    GamepadConfig {
        name: "Selkies Controller",
        btn_map: vec![BTN_A, BTN_B, BTN_X, BTN_Y, BTN_TL, BTN_TR, BTN_SELECT, BTN_START, BTN_MODE, BTN_THUMBL, BTN_THUMBR],
        axes_map: vec![ABS_X, ABS_Y, ABS_Z, ABS_RX, ABS_RY, ABS_RZ, ABS_HAT0X, ABS_HAT0Y],
        axes_to_btn: vec![
            AxisToBtn { axis: 2, buttons: vec![6] },
            AxisToBtn { axis: 5, buttons: vec![7] },
            AxisToBtn { axis: 6, buttons: vec![15, 14] },
            AxisToBtn { axis: 7, buttons: vec![13, 12] },
        ],
        axis_remap: HashMap::from([(2, 3), (3, 4)]),
        btn_remap: HashMap::from([(8, 6), (9, 7), (10, 9), (11, 10), (16, 8)]),
        trigger_axes: vec![2, 5],
    }
}

/// Looks up a config by canonical controller name, falling back to the
/// standard layout when unrecognized.
pub fn detect_gamepad_config(_name: &str) -> GamepadConfig {
    standard_xpad_config()
}

pub fn normalize_axis_val(val: f64) -> i32 {
    (ABS_MIN as f64 + ((val + 1.0) * (ABS_MAX - ABS_MIN) as f64) / 2.0).round() as i32
}

pub fn normalize_trigger_val(val: f64) -> i32 {
    (val * (ABS_MAX - ABS_MIN) as f64).round() as i32 + ABS_MIN
}

/// One normalized event ready for wire encoding: either a button or axis
/// update, carrying the already-remapped target index.
#[derive(Debug, Clone, PartialEq)]
pub enum MappedEvent {
    Button { num: u8, value: i16 },
    Axis { num: u8, value: i16 },
}

pub struct GamepadMapper {
    config: GamepadConfig,
}

impl GamepadMapper {
    pub fn new(config: GamepadConfig) -> Self {
        GamepadMapper { config }
    }

    pub fn config(&self) -> &GamepadConfig {
        &self.config
    }

    /// Maps an inbound button event, possibly redirecting it to an axis when
    /// the button is one half of an `axes_to_btn` pair.
    pub fn map_btn(&self, btn_num: u8, btn_val: f64) -> Option<MappedEvent> {
        for entry in &self.config.axes_to_btn {
            if let Some(pos) = entry.buttons.iter().position(|&b| b == btn_num) {
                let sign = if entry.buttons.len() > 1 && pos != 0 { -1.0 } else { 1.0 };
                let value = if self.config.trigger_axes.contains(&entry.axis) {
                    normalize_trigger_val(btn_val)
                } else {
                    normalize_axis_val(btn_val * sign)
                };
                return Some(MappedEvent::Axis { num: entry.axis, value: value as i16 });
            }
        }

        let mapped = *self.config.btn_remap.get(&btn_num).unwrap_or(&btn_num);
        if mapped as usize >= self.config.btn_map.len() {
            return None;
        }
        Some(MappedEvent::Button { num: mapped, value: btn_val as i16 })
    }

    pub fn map_axis(&self, axis_num: u8, axis_val: f64) -> Option<MappedEvent> {
        let mapped = *self.config.axis_remap.get(&axis_num).unwrap_or(&axis_num);
        if mapped as usize >= self.config.axes_map.len() {
            return None;
        }
        Some(MappedEvent::Axis { num: mapped, value: normalize_axis_val(axis_val) as i16 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_axis_maps_range() {
        assert_eq!(normalize_axis_val(-1.0), ABS_MIN);
        assert_eq!(normalize_axis_val(1.0), ABS_MAX);
        assert_eq!(normalize_axis_val(0.0), 0);
    }

    #[test]
    fn normalize_trigger_maps_zero_to_one() {
        assert_eq!(normalize_trigger_val(0.0), ABS_MIN);
        assert_eq!(normalize_trigger_val(1.0), ABS_MAX);
    }

    #[test]
    fn unrecognized_name_falls_back_to_standard_layout() {
        let cfg = detect_gamepad_config("Some Unknown Pad");
        assert_eq!(cfg.btn_map.len(), 11);
        assert_eq!(cfg.axes_map.len(), 8);
    }

    #[test]
    fn axes_to_btn_two_element_yields_signed_direction() {
        let mapper = GamepadMapper::new(standard_xpad_config());
        let pos = mapper.map_btn(15, 1.0).unwrap();
        let neg = mapper.map_btn(14, 1.0).unwrap();
        match (pos, neg) {
            (MappedEvent::Axis { num: na, value: va }, MappedEvent::Axis { num: nb, value: vb }) => {
                assert_eq!(na, nb);
                assert!(va > 0 && vb < 0);
            }
            _ => panic!("expected axis events"),
        }
    }

    #[test]
    fn regular_button_passes_through_remap_table() {
        let mapper = GamepadMapper::new(standard_xpad_config());
        let event = mapper.map_btn(8, 1.0).unwrap();
        assert_eq!(event, MappedEvent::Button { num: 6, value: 1 });
    }

    #[test]
    fn out_of_range_button_is_dropped() {
        let mapper = GamepadMapper::new(standard_xpad_config());
        assert_eq!(mapper.map_btn(200, 1.0), None);
    }
}
