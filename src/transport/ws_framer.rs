//! WebSocket frame encoding for the reduced (non-WebRTC) pipeline mode.
//!
//! Binary frames carry a one-byte data-type tag (`0x00` video, `0x01` audio),
//! a frame-type byte (delta/key), and a wrapping 16-bit frame id.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::Instant;

const VIDEO_DATA_TYPE: u8 = 0x00;
const AUDIO_DATA_TYPE: u8 = 0x01;

const VIDEO_FRAME_DELTA: u8 = 0x00;
const VIDEO_FRAME_KEY: u8 = 0x01;

/// Encodes a video elementary-stream frame: `[0x00][frame_type][frame_id_be][bytes]`.
pub fn encode_video_frame(frame_id: u16, is_keyframe: bool, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8(VIDEO_DATA_TYPE);
    buf.put_u8(if is_keyframe { VIDEO_FRAME_KEY } else { VIDEO_FRAME_DELTA });
    buf.put_u16(frame_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encodes an Opus audio packet: `[0x01][0x00][bytes]`.
pub fn encode_audio_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u8(AUDIO_DATA_TYPE);
    buf.put_u8(0x00);
    buf.put_slice(payload);
    buf.freeze()
}

/// Control-channel text framing: either `"<type>,<payload>"` comma framing for
/// non-JSON payloads, or raw JSON for structured payloads.
pub fn encode_comma_control(kind: &str, payload: &str) -> String {
    format!("{kind},{payload}")
}

pub fn encode_json_control<T: serde::Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

/// Wrapping per-session frame-id counter, used by both video frame emission
/// and the server FPS sampler below.
#[derive(Debug, Default)]
pub struct FrameIdCounter {
    next: u16,
}

impl FrameIdCounter {
    pub fn next(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// Rolling server-side FPS counter, recomputed every 2 seconds.
pub struct FpsCounter {
    count: u64,
    window_start: Instant,
    last_fps: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        FpsCounter {
            count: 0,
            window_start: Instant::now(),
            last_fps: 0.0,
        }
    }

    /// Registers one pulled sample. Returns `Some(fps)` when a new 2s window
    /// just closed, otherwise `None`.
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed.as_secs_f64() >= 2.0 {
            self.last_fps = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.window_start = Instant::now();
            Some(self.last_fps)
        } else {
            None
        }
    }

    pub fn current(&self) -> f64 {
        self.last_fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_header_matches_layout() {
        let frame = encode_video_frame(42, true, &[1, 2, 3]);
        assert_eq!(frame[0], VIDEO_DATA_TYPE);
        assert_eq!(frame[1], VIDEO_FRAME_KEY);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 42);
        assert_eq!(&frame[4..], &[1, 2, 3]);
    }

    #[test]
    fn audio_frame_header_matches_layout() {
        let frame = encode_audio_frame(&[9, 9]);
        assert_eq!(frame[0], AUDIO_DATA_TYPE);
        assert_eq!(frame[1], 0x00);
        assert_eq!(&frame[2..], &[9, 9]);
    }

    #[test]
    fn frame_id_counter_wraps_at_u16_max() {
        let mut counter = FrameIdCounter { next: u16::MAX };
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn comma_control_joins_kind_and_payload() {
        assert_eq!(encode_comma_control("clipboard", "aGVsbG8="), "clipboard,aGVsbG8=");
    }
}
