//! WebSocket fallback-transport orchestrator: the signaling socket doubles as
//! the binary frame carrier and the text control channel. No SDP exchange
//! happens here — frames start flowing as soon as the upgrade completes,
//! built over the reduced [`WsVideoPipeline`]/[`AudioWsPipeline`] pair
//! instead of `webrtcbin`.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::SessionDefaults;
use crate::error::SessionError;
use crate::input::router::parse as parse_input_op;
use crate::pipeline::audio::AudioWsPipeline;
use crate::pipeline::bus::{poll_bus_loop, BusEvent};
use crate::pipeline::ws_sink::WsVideoPipeline;
use crate::session::Session;
use crate::webrtc::ControlChannel;

/// One WebSocket-mode session's video (and audio) pipeline pair, held behind
/// the same `Arc<Mutex<..>>` idiom [`crate::session::Session`] uses for its
/// WebRTC counterpart so runtime setters stay uncontended across tasks.
pub struct WsSession {
    id: u64,
    video: Arc<Mutex<WsVideoPipeline>>,
    audio: Option<Arc<AudioWsPipeline>>,
    control: ControlChannel,
}

impl WsSession {
    /// Builds the reduced video pipeline (and, best-effort, its paired audio
    /// pipeline) for one client. An audio pipeline failure is logged and
    /// dropped rather than failing the whole session — video-only is a
    /// degraded but working session.
    pub fn new(id: u64, defaults: &SessionDefaults, test_mode: bool) -> Result<Self, SessionError> {
        let video = WsVideoPipeline::new(defaults, test_mode).map_err(SessionError::Pipeline)?;
        video.start().map_err(SessionError::Pipeline)?;

        let audio = match AudioWsPipeline::new(defaults.audio_bitrate_bps, defaults.audio_channels) {
            Ok(audio) => match audio.start() {
                Ok(()) => Some(Arc::new(audio)),
                Err(e) => {
                    warn!(session_id = id, error = %e, "ws audio pipeline failed to start, continuing video-only");
                    None
                }
            },
            Err(e) => {
                warn!(session_id = id, error = %e, "ws audio pipeline unavailable, continuing video-only");
                None
            }
        };

        Ok(WsSession { id, video: Arc::new(Mutex::new(video)), audio, control: ControlChannel::default() })
    }

    pub fn video(&self) -> Arc<Mutex<WsVideoPipeline>> {
        self.video.clone()
    }

    pub fn control_channel(&self) -> ControlChannel {
        self.control.clone()
    }

    /// Drives one client's full WebSocket lifetime: upgrades the socket,
    /// fans sample callbacks and control messages onto a single writer task
    /// (frames and control text share one sink, so ordering on the wire
    /// matches send order), and dispatches inbound text frames through the
    /// input router until the client disconnects or the pipeline reports
    /// EOS/error.
    pub async fn run(self, stream: TcpStream, session: Arc<Session>) -> Result<(), SessionError> {
        let ws_stream = accept_async(stream).await.map_err(|e| SessionError::Transport(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let session_id = self.id;
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    warn!(session_id, "failed to write to websocket, client gone");
                    break;
                }
            }
        });

        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        self.control.set_websocket(control_tx);
        let control_out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = control_rx.recv().await {
                if control_out.send(Message::Text(text)).is_err() {
                    break;
                }
            }
        });

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<bytes::Bytes>();
        let (fps_tx, mut fps_rx) = mpsc::unbounded_channel::<f64>();
        self.video.lock().install_sample_callback(frame_tx.clone(), fps_tx);
        if let Some(audio) = &self.audio {
            audio.install_sample_callback(frame_tx);
        }
        let frame_out = out_tx.clone();
        tokio::spawn(async move {
            while let Some(bytes) = frame_rx.recv().await {
                if frame_out.send(Message::Binary(bytes.to_vec())).is_err() {
                    break;
                }
            }
        });
        let stats_session = session.clone();
        tokio::spawn(async move {
            while let Some(fps) = fps_rx.recv().await {
                stats_session.set_server_fps(fps);
            }
        });

        self.install_bus_poll(session.cancel_token());

        info!(session_id = self.id, "ws session streaming");

        let session_cancel = session.cancel_token();
        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => {
                    info!(session_id = self.id, "ws session ending, pipeline reported eos/error");
                    break;
                }
                msg = ws_rx.next() => {
                    let Some(msg) = msg else { break };
                    let msg = msg.map_err(|e| SessionError::Transport(e.to_string()))?;
                    match msg {
                        Message::Text(text) => {
                            let op = parse_input_op(&text);
                            session.handle_input_op(op).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        writer.abort();
        Ok(())
    }

    /// Polls both the video and (when present) audio pipeline buses on the
    /// same 100ms tick, cancelling the session on EOS/error from either.
    fn install_bus_poll(&self, cancel: tokio_util::sync::CancellationToken) {
        let Some(video_bus) = self.video.lock().pipeline().bus() else { return };
        let audio_bus = self.audio.as_ref().and_then(|a| a.pipeline_bus());
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_bus_loop(video_bus, audio_bus, tx));

        let session_id = self.id;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BusEvent::Latency => {}
                    BusEvent::Eos => {
                        info!(session_id, "ws pipeline eos, ending session");
                        cancel.cancel();
                        break;
                    }
                    BusEvent::Error(msg) => {
                        warn!(session_id, error = msg, "ws pipeline error, ending session");
                        cancel.cancel();
                        break;
                    }
                    BusEvent::SourceWentToReady => {
                        info!(session_id, "ws pipeline source dropped to READY, ending session");
                        cancel.cancel();
                        break;
                    }
                }
            }
        });
        debug!(session_id = self.id, "ws bus poll installed");
    }
}
