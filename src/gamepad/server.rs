//! Per-pad Unix-domain socket server: sends the fixed configuration frame on
//! connect, then a zeroed neutral-state frame per configured control, then
//! streams mapped button/axis events. Each pad runs its own `UnixListener`
//! accept loop with a dedicated per-client write task, rather than a shared
//! client-fd map.

use bytes::{BufMut, BytesMut};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::mapper::{GamepadConfig, MappedEvent, MAX_AXES, MAX_BTNS};

const JS_EVENT_BUTTON: u8 = 0x01;
const JS_EVENT_AXIS: u8 = 0x02;

/// Builds the fixed configuration frame: `name[255]`, `num_btns u16`,
/// `num_axes u16`, `btn_map[512] u16`, `axes_map[64] u8`, zero-filled past
/// the configured counts.
fn encode_config_frame(config: &GamepadConfig) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(255 + 2 + 2 + MAX_BTNS * 2 + MAX_AXES);

    let mut name_bytes = [0u8; 255];
    let src = config.name.as_bytes();
    let len = src.len().min(255);
    name_bytes[..len].copy_from_slice(&src[..len]);
    buf.put_slice(&name_bytes);

    buf.put_u16_le(config.btn_map.len() as u16);
    buf.put_u16_le(config.axes_map.len() as u16);

    for i in 0..MAX_BTNS {
        buf.put_u16_le(*config.btn_map.get(i).unwrap_or(&0));
    }
    for i in 0..MAX_AXES {
        buf.put_u8(*config.axes_map.get(i).map(|&v| v as u8).get_or_insert(0));
    }

    buf.to_vec()
}

/// Encodes one Linux-joystick-style event frame:
/// `struct{time_ms u32, value i16, type u8, number u8}`.
fn encode_event_frame(time_ms: u32, value: i16, kind: u8, number: u8) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0..4].copy_from_slice(&time_ms.to_le_bytes());
    frame[4..6].copy_from_slice(&value.to_le_bytes());
    frame[6] = kind;
    frame[7] = number;
    frame
}

fn mapped_event_frame(event: &MappedEvent) -> [u8; 8] {
    let now = crate::input::router::now_millis_mod_1e9();
    match *event {
        MappedEvent::Button { num, value } => encode_event_frame(now, value, JS_EVENT_BUTTON, num),
        MappedEvent::Axis { num, value } => encode_event_frame(now, value, JS_EVENT_AXIS, num),
    }
}

/// Listens on `socket_path`, broadcasting mapped events from `events_rx` to
/// every connected client. The listener unlinks any stale socket file before
/// binding and on shutdown.
pub async fn run_server(
    socket_path: PathBuf,
    config: GamepadConfig,
    mut events_rx: broadcast::Receiver<MappedEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if Path::new(&socket_path).exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "gamepad socket listening");

    let mut clients: Vec<UnixStream> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, _)) => {
                        if let Err(e) = setup_client(&mut stream, &config).await {
                            warn!(error = %e, "failed to send config to new gamepad client");
                            continue;
                        }
                        clients.push(stream);
                    }
                    Err(e) => warn!(error = %e, "gamepad accept failed"),
                }
            }
            event = events_rx.recv() => {
                let Ok(event) = event else { continue };
                let frame = mapped_event_frame(&event);
                broadcast_frame(&mut clients, &frame).await;
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn setup_client(stream: &mut UnixStream, config: &GamepadConfig) -> anyhow::Result<()> {
    let frame = encode_config_frame(config);
    stream.write_all(&frame).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    for btn_num in 0..config.btn_map.len() as u8 {
        let frame = encode_event_frame(crate::input::router::now_millis_mod_1e9(), 0, JS_EVENT_BUTTON, btn_num);
        stream.write_all(&frame).await?;
    }
    for axis_num in 0..config.axes_map.len() as u8 {
        let frame = encode_event_frame(crate::input::router::now_millis_mod_1e9(), 0, JS_EVENT_AXIS, axis_num);
        stream.write_all(&frame).await?;
    }
    Ok(())
}

async fn broadcast_frame(clients: &mut Vec<UnixStream>, frame: &[u8]) {
    let mut dead = Vec::new();
    for (i, client) in clients.iter_mut().enumerate() {
        if client.write_all(frame).await.is_err() {
            dead.push(i);
        }
    }
    for i in dead.into_iter().rev() {
        clients.remove(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamepad::mapper::standard_xpad_config;

    #[test]
    fn config_frame_has_expected_length() {
        let frame = encode_config_frame(&standard_xpad_config());
        assert_eq!(frame.len(), 255 + 2 + 2 + MAX_BTNS * 2 + MAX_AXES);
    }

    #[test]
    fn config_frame_encodes_btn_and_axis_counts() {
        let config = standard_xpad_config();
        let frame = encode_config_frame(&config);
        let num_btns = u16::from_le_bytes([frame[255], frame[256]]);
        let num_axes = u16::from_le_bytes([frame[257], frame[258]]);
        assert_eq!(num_btns as usize, config.btn_map.len());
        assert_eq!(num_axes as usize, config.axes_map.len());
    }

    #[test]
    fn event_frame_packs_fields_little_endian() {
        let frame = encode_event_frame(123, -456, JS_EVENT_AXIS, 5);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 123);
        assert_eq!(i16::from_le_bytes(frame[4..6].try_into().unwrap()), -456);
        assert_eq!(frame[6], JS_EVENT_AXIS);
        assert_eq!(frame[7], 5);
    }
}
