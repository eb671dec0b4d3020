//! Parses the single-string data-channel protocol and dispatches each
//! operation to X11 (via `x11rb`'s XTEST extension) or to the owning
//! session's other subsystems (gamepad, clipboard, resize, bitrate).
//!
//! Tokenized into an enum the caller matches on, rather than a long chain
//! of string comparisons: same token vocabulary, same keysym-60 special
//! case, same button-mask diffing as the wire protocol requires.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

/// One parsed client→server input operation.
#[derive(Debug, Clone, PartialEq)]
pub enum InputOp {
    KeyDown(u32),
    KeyUp(u32),
    KeyReset,
    MouseAbsolute { x: i32, y: i32, mask: u8, scroll_magnitude: i32 },
    MouseRelative { x: i32, y: i32, mask: u8, scroll_magnitude: i32 },
    PointerVisible(bool),
    VideoBitrate(u32),
    AudioBitrate(u32),
    GamepadConnect { index: u8, name: String, num_axes: u32, num_btns: u32 },
    GamepadDisconnect { index: u8 },
    GamepadButton { index: u8, btn: u8, value: f64 },
    GamepadAxis { index: u8, axis: u8, value: f64 },
    ClipboardRead,
    ClipboardWrite(String),
    Resize { width: u32, height: u32 },
    ScalingRatio(f64),
    Pong,
    SetFramerate(u32),
    SetResizeEnabled { enabled: bool, resolution: Option<(u32, u32)> },
    ClientFps(u32),
    ClientLatencyMs(u32),
    ClientStats { kind: String, json: String },
    TypeText(String),
    Unknown(String),
}

const RESOLUTION_RE_SRC: &str = r"^\d+x\d+$";

/// Parses one `op,arg1,arg2,...` (or bare `op`) message.
pub fn parse(msg: &str) -> InputOp {
    let toks: Vec<&str> = msg.split(',').collect();
    match toks.as_slice() {
        ["pong"] => InputOp::Pong,
        ["kd", ks] => ks.parse().map(InputOp::KeyDown).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["ku", ks] => ks.parse().map(InputOp::KeyUp).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["kr"] => InputOp::KeyReset,
        ["m", x, y, mask, scroll] | ["m2", x, y, mask, scroll] => {
            let relative = toks[0] == "m2";
            let parsed = (|| -> Option<(i32, i32, u8, i32)> {
                Some((x.parse().ok()?, y.parse().ok()?, mask.parse().ok()?, scroll.parse().ok()?))
            })();
            match parsed {
                Some((x, y, mask, scroll)) if relative => {
                    InputOp::MouseRelative { x, y, mask, scroll_magnitude: scroll }
                }
                Some((x, y, mask, scroll)) => InputOp::MouseAbsolute { x, y, mask, scroll_magnitude: scroll },
                None => InputOp::MouseAbsolute { x: 0, y: 0, mask: 0, scroll_magnitude: 0 },
            }
        }
        ["p", v] => InputOp::PointerVisible(*v != "0"),
        ["vb", bps] => bps.parse().map(InputOp::VideoBitrate).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["ab", bps] => bps.parse().map(InputOp::AudioBitrate).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["js", "c", n, b64name, axes, btns] => {
            let index = n.parse().unwrap_or(0);
            let name = base64_decode_name(b64name);
            InputOp::GamepadConnect {
                index,
                name,
                num_axes: axes.parse().unwrap_or(0),
                num_btns: btns.parse().unwrap_or(0),
            }
        }
        ["js", "d", n] => InputOp::GamepadDisconnect { index: n.parse().unwrap_or(0) },
        ["js", "b", n, btn, val] => InputOp::GamepadButton {
            index: n.parse().unwrap_or(0),
            btn: btn.parse().unwrap_or(0),
            value: val.parse().unwrap_or(0.0),
        },
        ["js", "a", n, axis, val] => InputOp::GamepadAxis {
            index: n.parse().unwrap_or(0),
            axis: axis.parse().unwrap_or(0),
            value: val.parse().unwrap_or(0.0),
        },
        ["cr"] => InputOp::ClipboardRead,
        ["cw", b64] => InputOp::ClipboardWrite(b64.to_string()),
        ["r", res] => match parse_resolution(res) {
            Some((w, h)) => InputOp::Resize { width: w, height: h },
            None => InputOp::Unknown(msg.into()),
        },
        ["s", scale] => scale.parse().map(InputOp::ScalingRatio).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["_arg_fps", fps] => fps.parse().map(InputOp::SetFramerate).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["_arg_resize", enabled, res] => {
            let enabled = enabled.eq_ignore_ascii_case("true");
            InputOp::SetResizeEnabled { enabled, resolution: parse_resolution(res) }
        }
        ["_f", n] => n.parse().map(InputOp::ClientFps).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        ["_l", n] => n.parse().map(InputOp::ClientLatencyMs).unwrap_or_else(|_| InputOp::Unknown(msg.into())),
        [kind @ ("_stats_video" | "_stats_audio"), rest @ ..] => InputOp::ClientStats {
            kind: kind.to_string(),
            json: rest.join(","),
        },
        ["co", "end", text @ ..] => InputOp::TypeText(text.join(",")),
        _ => InputOp::Unknown(msg.into()),
    }
}

fn parse_resolution(res: &str) -> Option<(u32, u32)> {
    if !regex::Regex::new(RESOLUTION_RE_SRC).unwrap().is_match(res) {
        return None;
    }
    let (w, h) = res.split_once('x')?;
    let w: u32 = w.parse().ok()?;
    let h: u32 = h.parse().ok()?;
    // round up to an even pixel count, per the resizer's mode requirements
    Some((w + w % 2, h + h % 2))
}

fn base64_decode_name(b64: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD
        .decode(b64)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(|s| s.chars().take(255).collect())
        .unwrap_or_default()
}

/// Fixed modifier/hotkey reset set sent on `kr`.
const RESET_KEYSYMS: &[u32] = &[
    65507, 65505, 65513, 65508, 65506, 65027, 65511, 65512, 102, 70, 109, 77, 65307,
];

/// Injects X11 key and mouse events via the XTEST extension.
pub struct X11Injector {
    conn: RustConnection,
    root: u32,
    button_mask: u8,
    min_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: Vec<u32>,
}

impl X11Injector {
    pub fn connect() -> anyhow::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let root = conn.setup().roots[screen_num].root;
        let min_keycode = conn.setup().min_keycode;
        let max_keycode = conn.setup().max_keycode;
        let mapping = conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)?
            .reply()?;
        Ok(X11Injector {
            conn,
            root,
            button_mask: 0,
            min_keycode,
            keysyms_per_keycode: mapping.keysyms_per_keycode,
            keysyms: mapping.keysyms,
        })
    }

    /// Keysym 60 ('<') is remapped to 44 (',') when the local keymap's
    /// keycode for 60 collides with keycode 94.
    pub fn send_keypress(&self, keysym: u32, down: bool) -> anyhow::Result<()> {
        let keysym = if keysym == 60 && self.keycode_for(keysym) == Some(94) {
            44
        } else {
            keysym
        };
        let Some(keycode) = self.keycode_for(keysym) else {
            warn!(keysym, "no keycode mapping for keysym, dropping keypress");
            return Ok(());
        };
        self.conn.xtest_fake_input(
            if down { x11rb::protocol::xproto::KEY_PRESS_EVENT } else { x11rb::protocol::xproto::KEY_RELEASE_EVENT },
            keycode,
            0,
            self.root,
            0,
            0,
            0,
        )?;
        self.conn.flush()?;
        Ok(())
    }

    /// First keycode whose keysym group (as loaded by `GetKeyboardMapping`)
    /// contains `keysym`, matching pynput/Xlib's `keysym_to_keycode` lookup.
    fn keycode_for(&self, keysym: u32) -> Option<u8> {
        let groups = self.keysyms.chunks(self.keysyms_per_keycode as usize);
        for (i, group) in groups.enumerate() {
            if group.iter().any(|&ks| ks == keysym) {
                return Some(self.min_keycode + i as u8);
            }
        }
        None
    }

    pub fn reset_keyboard(&self) {
        for &ks in RESET_KEYSYMS {
            if let Err(e) = self.send_keypress(ks, false) {
                warn!(keysym = ks, error = %e, "failed to release modifier during reset");
            }
        }
    }

    /// Moves the pointer and diffs `mask` against the previously stored
    /// button mask, emitting one press/release per changed bit 0..4 (left,
    /// middle, right, wheel-up, wheel-down), wheel events repeated
    /// `scroll_magnitude` times.
    pub fn send_mouse(&mut self, x: i32, y: i32, mask: u8, scroll_magnitude: i32, relative: bool) -> anyhow::Result<()> {
        if relative {
            self.conn.xtest_fake_input(x11rb::protocol::xproto::MOTION_NOTIFY_EVENT, 1, 0, self.root, x as i16, y as i16, 0)?;
        } else {
            self.conn.xtest_fake_input(x11rb::protocol::xproto::MOTION_NOTIFY_EVENT, 0, 0, self.root, x as i16, y as i16, 0)?;
        }

        if mask != self.button_mask {
            for i in 0..5u8 {
                let changed = (mask ^ self.button_mask) & (1 << i) != 0;
                if !changed {
                    continue;
                }
                match i {
                    0..=2 => {
                        let button = i + 1;
                        let event_type = if mask & (1 << i) != 0 {
                            x11rb::protocol::xproto::BUTTON_PRESS_EVENT
                        } else {
                            x11rb::protocol::xproto::BUTTON_RELEASE_EVENT
                        };
                        self.conn.xtest_fake_input(event_type, button, 0, self.root, 0, 0, 0)?;
                    }
                    3 | 4 if mask != 0 => {
                        let button = if i == 3 { 4 } else { 5 };
                        for _ in 0..scroll_magnitude.max(1) {
                            self.conn.xtest_fake_input(x11rb::protocol::xproto::BUTTON_PRESS_EVENT, button, 0, self.root, 0, 0, 0)?;
                            self.conn.xtest_fake_input(x11rb::protocol::xproto::BUTTON_RELEASE_EVENT, button, 0, self.root, 0, 0, 0)?;
                        }
                    }
                    _ => {}
                }
            }
            self.button_mask = mask;
        }

        if !relative {
            self.conn.flush()?;
        }
        Ok(())
    }
}

/// `co end <text>` dispatches to `xdotool type`, 3s bounded, non-fatal on
/// failure or missing binary.
pub fn type_text(text: &str) {
    let result = Command::new("xdotool").arg("type").arg(text).output();
    match result {
        Ok(output) if output.status.success() => {
            info!(len = text.len(), "typed text via xdotool");
        }
        Ok(output) => {
            warn!(code = ?output.status.code(), "xdotool type exited non-zero");
        }
        Err(e) => warn!(error = %e, "xdotool not available"),
    }
}

pub fn now_millis_mod_1e9() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    (millis % 1_000_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keydown() {
        assert_eq!(parse("kd,65"), InputOp::KeyDown(65));
    }

    #[test]
    fn parses_mouse_absolute() {
        assert_eq!(
            parse("m,10,20,3,1"),
            InputOp::MouseAbsolute { x: 10, y: 20, mask: 3, scroll_magnitude: 1 }
        );
    }

    #[test]
    fn mouse_relative_falls_back_to_absolute_zero_on_parse_failure() {
        assert_eq!(
            parse("m2,bad,20,3,1"),
            InputOp::MouseAbsolute { x: 0, y: 0, mask: 0, scroll_magnitude: 0 }
        );
    }

    #[test]
    fn rejects_invalid_resolution() {
        assert_eq!(parse("r,not-a-resolution"), InputOp::Unknown("r,not-a-resolution".into()));
    }

    #[test]
    fn accepts_and_evens_out_resolution() {
        assert_eq!(parse("r,1281x721"), InputOp::Resize { width: 1282, height: 722 });
    }

    #[test]
    fn type_text_joins_commas_in_payload() {
        assert_eq!(parse("co,end,hello,world"), InputOp::TypeText("hello,world".into()));
    }

    #[test]
    fn gamepad_connect_decodes_base64_name() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let encoded = STANDARD.encode("Xbox 360 Controller");
        let op = parse(&format!("js,c,0,{encoded},8,11"));
        assert_eq!(
            op,
            InputOp::GamepadConnect { index: 0, name: "Xbox 360 Controller".into(), num_axes: 8, num_btns: 11 }
        );
    }

    #[test]
    fn unknown_op_is_preserved_verbatim() {
        assert_eq!(parse("bogus,1,2"), InputOp::Unknown("bogus,1,2".into()));
    }
}
