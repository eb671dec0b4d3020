//! XFIXES cursor-change monitor: tracks the root window's cursor image and
//! emits a cached, base64-encoded PNG message per distinct cursor serial.
//!
//! Reinterprets the fetched ARGB pixels as RGBA via a byte swap, flags a
//! fully-zero image with `override: "none"`, and polls pending cursor-change
//! events cooperatively every 100ms.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

#[derive(Debug, Clone, Serialize)]
pub struct CursorMessage {
    pub png_base64: String,
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    /// `"none"` when the cursor image is fully transparent/zero, telling the
    /// client to hide its own cursor rendering.
    pub r#override: Option<&'static str>,
}

pub struct CursorMonitor {
    conn: RustConnection,
    root: u32,
    cache: HashMap<u32, CursorMessage>,
}

impl CursorMonitor {
    pub fn connect() -> anyhow::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None)?;
        xfixes::query_version(&conn, 5, 0)?.reply()?;
        let root = conn.setup().roots[screen_num].root;
        xfixes::select_cursor_input(&conn, root, xfixes::XFIXES_CURSOR_NOTIFY_MASK)?;
        Ok(CursorMonitor { conn, root, cache: HashMap::new() })
    }

    /// Cooperative poll loop: checks for a pending cursor-notify event every
    /// 100ms when the queue is empty, emitting a message on `tx` for each new
    /// serial. Exits when `cancel` is triggered.
    pub async fn run(mut self, tx: tokio::sync::mpsc::UnboundedSender<CursorMessage>, cancel: CancellationToken) {
        if let Some(msg) = self.fetch_current() {
            let _ = tx.send(msg);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }

            while let Ok(Some(event)) = self.conn.poll_for_event() {
                if let x11rb::protocol::Event::XfixesCursorNotify(_) = event {
                    if let Some(msg) = self.fetch_current() {
                        if tx.send(msg).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fetch_current(&mut self) -> Option<CursorMessage> {
        let image = xfixes::get_cursor_image(&self.conn).ok()?.reply().ok()?;
        if let Some(cached) = self.cache.get(&image.cursor_serial) {
            return Some(cached.clone());
        }

        let rgba = argb_words_to_rgba(&image.cursor_image);
        let all_zero = rgba.iter().all(|&b| b == 0);
        let png = encode_png(image.width, image.height, &rgba).ok()?;

        let msg = CursorMessage {
            png_base64: STANDARD.encode(png),
            hotspot_x: image.xhot,
            hotspot_y: image.yhot,
            r#override: if all_zero { Some("none") } else { None },
        };
        self.cache.insert(image.cursor_serial, msg.clone());
        debug!(serial = image.cursor_serial, "cached new cursor image");
        Some(msg)
    }
}

/// XFIXES hands back each pixel as a 32-bit ARGB word; reinterpret as RGBA by
/// reading shifts 16, 8, 0, 24 in that order.
fn argb_words_to_rgba(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for &word in words {
        out.push((word >> 16) as u8);
        out.push((word >> 8) as u8);
        out.push(word as u8);
        out.push((word >> 24) as u8);
    }
    out
}

fn encode_png(width: u16, height: u16, rgba: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, width as u32, height as u32);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argb_to_rgba_swaps_byte_order() {
        let word = 0xAA_BB_CC_DDu32; // A=AA R=BB G=CC B=DD
        let rgba = argb_words_to_rgba(&[word]);
        assert_eq!(rgba, vec![0xBB, 0xCC, 0xDD, 0xAA]);
    }

    #[test]
    fn all_zero_image_encodes_without_error() {
        let rgba = vec![0u8; 16];
        let png = encode_png(2, 2, &rgba).expect("encode");
        assert!(!png.is_empty());
    }
}
