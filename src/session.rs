//! Session data model: one entry per connected client, owning its pipeline,
//! input router state, and virtual gamepads. Uses a `HashMap<id, Session>`
//! plus `Arc<Mutex<..>>` registration idiom, generalised from "one WebRTC
//! client" to the full set of per-client subsystems: video/audio pipeline,
//! input router, clipboard and cursor monitors, and virtual gamepads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::gamepad::mapper::{GamepadMapper, MappedEvent};
use crate::input::clipboard;
use crate::input::cursor::{CursorMessage, CursorMonitor};
use crate::input::router::{type_text, InputOp, X11Injector};
use crate::pipeline::ws_sink::WsVideoPipeline;
use crate::pipeline::VideoPipeline;
use crate::transport::ws_session::WsSession;
use crate::webrtc::{ControlChannel, PayloaderKind, WebRtcSession};

/// The session's video pipeline handle, one variant per transport mode. Both
/// [`VideoPipeline`] and [`WsVideoPipeline`] expose the same runtime-setter
/// trio (`set_pointer_visible`/`set_video_bitrate`/`set_framerate`); this enum
/// just picks which one `Session::handle_input_op` drives, since the two
/// pipeline graphs differ past the shared source/encoder tier.
pub enum VideoSink {
    WebRtc(Arc<Mutex<VideoPipeline>>),
    Ws(Arc<Mutex<WsVideoPipeline>>),
}

impl VideoSink {
    fn set_pointer_visible(&self, visible: bool) {
        match self {
            VideoSink::WebRtc(v) => v.lock().set_pointer_visible(visible),
            VideoSink::Ws(v) => v.lock().set_pointer_visible(visible),
        }
    }

    fn set_framerate(&self, fps: i32) {
        match self {
            VideoSink::WebRtc(v) => v.lock().set_framerate(fps),
            VideoSink::Ws(v) => v.lock().set_framerate(fps),
        }
    }

    fn stop(&self) {
        match self {
            VideoSink::WebRtc(v) => {
                let _ = v.lock().stop();
            }
            VideoSink::Ws(v) => {
                let _ = v.lock().stop();
            }
        }
    }
}

/// Output-stats scratchpad attached to each session: current server FPS
/// (WebSocket mode only), last cursor serial sent, current frame id, and
/// the client-reported counters echoed back over `_f`/`_l`/`s`.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub server_fps: f64,
    pub last_cursor_serial: Option<u32>,
    pub frame_id: u16,
    pub client_fps: u32,
    pub client_latency_ms: u32,
    pub scaling_ratio: f64,
    pub resize_enabled: bool,
}

/// A connected gamepad slot, 0..=3. Torn down when `js,d,<n>` arrives or the
/// session ends.
pub struct GamepadSlot {
    pub events_tx: broadcast::Sender<MappedEvent>,
    pub mapper: GamepadMapper,
    pub cancel: CancellationToken,
}

pub struct Session {
    pub id: u64,
    video: VideoSink,
    control: ControlChannel,
    stats: Mutex<SessionStats>,
    gamepads: Mutex<HashMap<u8, GamepadSlot>>,
    cursor_cache: Mutex<HashMap<u32, CursorMessage>>,
    x11: Mutex<Option<X11Injector>>,
    config: Arc<Config>,
    test_mode: bool,
    cancel: CancellationToken,
}

impl Session {
    fn new(id: u64, video: VideoSink, control: ControlChannel, config: Arc<Config>, test_mode: bool) -> Self {
        Session {
            id,
            video,
            control,
            stats: Mutex::new(SessionStats::default()),
            gamepads: Mutex::new(HashMap::new()),
            cursor_cache: Mutex::new(HashMap::new()),
            x11: Mutex::new(None),
            config,
            test_mode,
            cancel: CancellationToken::new(),
        }
    }

    pub fn control_channel(&self) -> ControlChannel {
        self.control.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    pub fn set_server_fps(&self, fps: f64) {
        self.stats.lock().server_fps = fps;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the cursor-image and clipboard-out monitors for this session,
    /// gated by the feature toggles and skipped entirely under `test_mode`
    /// (there is no real X11 display to poll in the test harness).
    pub fn spawn_monitors(self: &Arc<Self>) {
        if self.test_mode {
            return;
        }

        if self.config.features.cursor_monitor {
            let session = self.clone();
            tokio::spawn(async move {
                let monitor = match tokio::task::spawn_blocking(CursorMonitor::connect).await {
                    Ok(Ok(monitor)) => monitor,
                    Ok(Err(e)) => {
                        warn!(session_id = session.id, error = %e, "cursor monitor unavailable");
                        return;
                    }
                    Err(e) => {
                        warn!(session_id = session.id, error = %e, "cursor monitor task panicked");
                        return;
                    }
                };
                let (tx, mut rx) = mpsc::unbounded_channel();
                let cancel = session.cancel_token();
                let forward_cancel = cancel.clone();
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        session.control.send_json(&serde_json::json!({ "type": "cursor", "data": msg }));
                        if forward_cancel.is_cancelled() {
                            break;
                        }
                    }
                });
                monitor.run(tx, cancel).await;
            });
        }

        if self.config.features.clipboard_out {
            let session = self.clone();
            let cancel = self.cancel_token();
            tokio::spawn(async move {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let forward_session = session.clone();
                tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        use base64::{engine::general_purpose::STANDARD, Engine};
                        forward_session.control.send_json(&serde_json::json!({
                            "type": "clipboard",
                            "data": STANDARD.encode(text),
                        }));
                    }
                });
                clipboard::poll_loop(tx, cancel).await;
            });
        }
    }

    /// Dispatches one parsed input-router operation. Never returns an error:
    /// every subsystem here is best-effort against a live X11/session and
    /// logs rather than tears the session down on failure.
    pub async fn handle_input_op(self: &Arc<Self>, op: InputOp) {
        match op {
            InputOp::KeyDown(keysym) => self.with_injector(|x| x.send_keypress(keysym, true)),
            InputOp::KeyUp(keysym) => self.with_injector(|x| x.send_keypress(keysym, false)),
            InputOp::KeyReset => self.with_injector(|x| {
                x.reset_keyboard();
                Ok(())
            }),
            InputOp::MouseAbsolute { x, y, mask, scroll_magnitude } => {
                self.with_injector_mut(|inj| inj.send_mouse(x, y, mask, scroll_magnitude, false))
            }
            InputOp::MouseRelative { x, y, mask, scroll_magnitude } => {
                self.with_injector_mut(|inj| inj.send_mouse(x, y, mask, scroll_magnitude, true))
            }
            InputOp::PointerVisible(visible) => self.video.set_pointer_visible(visible),
            InputOp::VideoBitrate(bps) => {
                match &self.video {
                    VideoSink::WebRtc(v) => {
                        let fec_audio_bitrate = self.config.session_defaults.audio_bitrate_bps;
                        v.lock().set_video_bitrate(bps, false, fec_audio_bitrate);
                    }
                    VideoSink::Ws(v) => v.lock().set_video_bitrate(bps),
                }
                self.control.send_json(&serde_json::json!({
                    "type": "pipeline",
                    "data": format!("Video bitrate set to: {bps}"),
                }));
            }
            InputOp::AudioBitrate(bps) => {
                debug!(session_id = self.id, bps, "audio bitrate change requested, no runtime-mutable audio encoder handle wired yet");
            }
            InputOp::GamepadConnect { index, name, num_axes, num_btns } => {
                self.connect_gamepad(index, name, num_axes, num_btns, &self.config.gamepad.socket_dir.clone())
            }
            InputOp::GamepadDisconnect { index } => self.disconnect_gamepad(index),
            InputOp::GamepadButton { index, btn, value } => {
                let mapped = self.gamepads.lock().get(&index).and_then(|slot| slot.mapper.map_btn(btn, value));
                if let Some(event) = mapped {
                    self.send_gamepad_event(index, event);
                }
            }
            InputOp::GamepadAxis { index, axis, value } => {
                let mapped = self.gamepads.lock().get(&index).and_then(|slot| slot.mapper.map_axis(axis, value));
                if let Some(event) = mapped {
                    self.send_gamepad_event(index, event);
                }
            }
            InputOp::ClipboardRead => {
                let text = clipboard::read_clipboard().await;
                if let Some(text) = text {
                    use base64::{engine::general_purpose::STANDARD, Engine};
                    self.control.send_json(&serde_json::json!({ "type": "clipboard", "data": STANDARD.encode(text) }));
                }
            }
            InputOp::ClipboardWrite(b64) => {
                use base64::{engine::general_purpose::STANDARD, Engine};
                if let Some(text) = STANDARD.decode(&b64).ok().and_then(|b| String::from_utf8(b).ok()) {
                    if text.len() <= clipboard::MAX_CLIPBOARD_PAYLOAD_BYTES {
                        clipboard::write_clipboard(&text).await;
                    } else {
                        warn!(session_id = self.id, "dropping oversize clipboard write payload");
                    }
                }
            }
            InputOp::Resize { width, height } => {
                if self.config.features.resize {
                    tokio::task::spawn_blocking(move || crate::display::resizer::resize(width, height)).await.ok();
                }
            }
            InputOp::ScalingRatio(ratio) => {
                self.stats.lock().scaling_ratio = ratio;
            }
            InputOp::Pong => trace!(session_id = self.id, "pong received"),
            InputOp::SetFramerate(fps) => self.video.set_framerate(fps as i32),
            InputOp::SetResizeEnabled { enabled, resolution } => {
                self.stats.lock().resize_enabled = enabled;
                if enabled {
                    if let Some((width, height)) = resolution {
                        if self.config.features.resize {
                            tokio::task::spawn_blocking(move || crate::display::resizer::resize(width, height)).await.ok();
                        }
                    }
                }
            }
            InputOp::ClientFps(fps) => self.stats.lock().client_fps = fps,
            InputOp::ClientLatencyMs(ms) => self.stats.lock().client_latency_ms = ms,
            InputOp::ClientStats { kind, json } => trace!(session_id = self.id, kind, json, "client stats received"),
            InputOp::TypeText(text) => {
                tokio::task::spawn_blocking(move || type_text(&text)).await.ok();
            }
            InputOp::Unknown(raw) => warn!(session_id = self.id, raw, "unrecognized input op"),
        }
    }

    fn with_injector(&self, f: impl FnOnce(&X11Injector) -> anyhow::Result<()>) {
        let mut guard = self.x11.lock();
        if guard.is_none() {
            match X11Injector::connect() {
                Ok(injector) => *guard = Some(injector),
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "failed to connect X11 injector");
                    return;
                }
            }
        }
        if let Some(injector) = guard.as_ref() {
            if let Err(e) = f(injector) {
                warn!(session_id = self.id, error = %e, "x11 injection failed");
            }
        }
    }

    fn with_injector_mut(&self, f: impl FnOnce(&mut X11Injector) -> anyhow::Result<()>) {
        let mut guard = self.x11.lock();
        if guard.is_none() {
            match X11Injector::connect() {
                Ok(injector) => *guard = Some(injector),
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "failed to connect X11 injector");
                    return;
                }
            }
        }
        if let Some(injector) = guard.as_mut() {
            if let Err(e) = f(injector) {
                warn!(session_id = self.id, error = %e, "x11 injection failed");
            }
        }
    }

    /// Registers a newly connected virtual gamepad, spawning its Unix socket
    /// server. Replaces any existing slot at the same index (matching the
    /// source's `__js_connect` overwrite-on-reconnect behavior).
    pub fn connect_gamepad(&self, index: u8, name: String, num_axes: u32, num_btns: u32, socket_dir: &str) {
        let config = crate::gamepad::mapper::detect_gamepad_config(&name);
        let mapper = GamepadMapper::new(config.clone());
        let (tx, rx) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let socket_path = PathBuf::from(socket_dir).join(format!("selkies-js{index}.sock"));

        let task_cancel = cancel.clone();
        let session_id = self.id;
        tokio::spawn(async move {
            if let Err(e) = crate::gamepad::server::run_server(socket_path, config, rx, task_cancel).await {
                warn!(session_id, index, error = %e, "gamepad server exited with error");
            }
        });

        let _ = num_axes;
        let _ = num_btns;
        self.gamepads.lock().insert(index, GamepadSlot { events_tx: tx, mapper, cancel });
        info!(session_id = self.id, index, "gamepad connected");
    }

    pub fn disconnect_gamepad(&self, index: u8) {
        if let Some(slot) = self.gamepads.lock().remove(&index) {
            slot.cancel.cancel();
        }
    }

    pub fn send_gamepad_event(&self, index: u8, event: MappedEvent) {
        if let Some(slot) = self.gamepads.lock().get(&index) {
            let _ = slot.events_tx.send(event);
        }
    }

    fn teardown(&self) {
        self.cancel.cancel();
        for (_, slot) in self.gamepads.lock().drain() {
            slot.cancel.cancel();
        }
        self.video.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owns the registry of live sessions and hands off accepted TCP connections
/// to a fresh [`Session`] + [`WebRtcSession`] pair.
pub struct SessionManager {
    config: Arc<Config>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        SessionManager {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Builds a video (and, in WebSocket mode, audio) pipeline, wraps it in
    /// the transport orchestrator its [`TransportMode`](crate::config::TransportMode)
    /// selects, and drives the signaling/streaming exchange to completion on
    /// the accepted stream. Removes the session from the registry when the
    /// connection ends.
    pub async fn accept(self: &Arc<Self>, stream: TcpStream, test_mode: bool) -> Result<(), SessionError> {
        if self.session_count() >= self.config.server.max_clients {
            return Err(SessionError::Transport("max_clients reached".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        match self.config.server.transport_mode {
            crate::config::TransportMode::Webrtc => self.accept_webrtc(id, stream, test_mode).await,
            crate::config::TransportMode::Websockets => self.accept_websocket(id, stream, test_mode).await,
        }
    }

    async fn accept_webrtc(self: &Arc<Self>, id: u64, stream: TcpStream, test_mode: bool) -> Result<(), SessionError> {
        let video = VideoPipeline::new(&self.config.session_defaults, "x11", test_mode)
            .map_err(SessionError::Pipeline)?;
        video.start().map_err(SessionError::Pipeline)?;
        let video = Arc::new(Mutex::new(video));

        let payloader_kind = PayloaderKind::from(self.config.session_defaults.encoder.payloader_family());
        let (encoding_name, payload_type) = rtp_encoding_for(payloader_kind);
        let fec_audio_bitrate = self.config.session_defaults.audio_bitrate_bps;

        let webrtc_session = WebRtcSession::new(
            id,
            video.clone(),
            &self.config.webrtc,
            payloader_kind,
            payload_type,
            encoding_name,
            fec_audio_bitrate,
            self.config.session_defaults.audio_packetloss_percent,
            self.config.session_defaults.audio_channels,
        )?;
        let control = webrtc_session.control_channel();

        let session = Arc::new(Session::new(id, VideoSink::WebRtc(video), control, self.config.clone(), test_mode));
        session.spawn_monitors();
        self.sessions.lock().insert(id, session.clone());
        info!(session_id = id, total = self.session_count(), "session created");

        let result = webrtc_session.run(stream, session.clone()).await;

        self.sessions.lock().remove(&id);
        info!(session_id = id, "session ended");
        result
    }

    async fn accept_websocket(self: &Arc<Self>, id: u64, stream: TcpStream, test_mode: bool) -> Result<(), SessionError> {
        let ws_session = WsSession::new(id, &self.config.session_defaults, test_mode)?;
        let control = ws_session.control_channel();
        let video = ws_session.video();

        let session = Arc::new(Session::new(id, VideoSink::Ws(video), control, self.config.clone(), test_mode));
        session.spawn_monitors();
        self.sessions.lock().insert(id, session.clone());
        info!(session_id = id, total = self.session_count(), "session created");

        let result = ws_session.run(stream, session.clone()).await;

        self.sessions.lock().remove(&id);
        info!(session_id = id, "session ended");
        result
    }
}

fn rtp_encoding_for(kind: PayloaderKind) -> (&'static str, u32) {
    match kind {
        PayloaderKind::H264 => ("H264", 102),
        PayloaderKind::H265 => ("H265", 104),
        PayloaderKind::Vp => ("VP8", 96),
        PayloaderKind::Av1 => ("AV1", 106),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_encoding_matches_payloader_kind() {
        assert_eq!(rtp_encoding_for(PayloaderKind::H264).0, "H264");
        assert_eq!(rtp_encoding_for(PayloaderKind::Vp).0, "VP8");
    }
}
