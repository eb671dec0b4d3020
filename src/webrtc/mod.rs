pub mod sdp;
pub mod session;

pub use session::{SessionState, WebRtcSession};

use std::sync::Arc;

use gstreamer_webrtc as gst_webrtc;
use gstreamer_webrtc::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

enum ControlSink {
    None,
    DataChannel(gst_webrtc::WebRTCDataChannel),
    WebSocket(mpsc::UnboundedSender<String>),
}

/// A handle to a session's outbound control channel, shared between the
/// transport orchestrator (WebRTC data channel, or the WebSocket-fallback
/// text sink) and the session's input/control-message dispatch. Outbound
/// sends are silently dropped while the channel isn't open yet;
/// this is also the "Control message" abstraction, which sends the
/// same `{type, data}` content as JSON on the data channel or as raw JSON /
/// `"<type>,<payload>"` comma framing over the WebSocket, noting that
/// both transports carry the same control-message content.
#[derive(Clone)]
pub struct ControlChannel(Arc<Mutex<ControlSink>>);

impl Default for ControlChannel {
    fn default() -> Self {
        ControlChannel(Arc::new(Mutex::new(ControlSink::None)))
    }
}

impl ControlChannel {
    pub fn set(&self, channel: gst_webrtc::WebRTCDataChannel) {
        *self.0.lock() = ControlSink::DataChannel(channel);
    }

    pub fn set_websocket(&self, tx: mpsc::UnboundedSender<String>) {
        *self.0.lock() = ControlSink::WebSocket(tx);
    }

    pub fn is_open(&self) -> bool {
        match &*self.0.lock() {
            ControlSink::DataChannel(channel) => channel.ready_state() == gst_webrtc::WebRTCDataChannelState::Open,
            ControlSink::WebSocket(_) => true,
            ControlSink::None => false,
        }
    }

    /// Sends a `{type, data}` control message as JSON. Dropped silently when
    /// the data channel isn't open yet, or no sink has been set at all.
    pub fn send_json(&self, msg: &serde_json::Value) {
        match &*self.0.lock() {
            ControlSink::DataChannel(channel) => {
                if channel.ready_state() != gst_webrtc::WebRTCDataChannelState::Open {
                    trace!("dropping control message, data channel not open");
                    return;
                }
                channel.send_string(Some(&msg.to_string()));
            }
            ControlSink::WebSocket(tx) => {
                let _ = tx.send(msg.to_string());
            }
            ControlSink::None => {}
        }
    }

    /// Sends `"<kind>,<payload>"` comma framing for a non-JSON control
    /// payload. Only meaningful in WebSocket mode; a no-op elsewhere.
    pub fn send_comma(&self, kind: &str, payload: &str) {
        if let ControlSink::WebSocket(tx) = &*self.0.lock() {
            let _ = tx.send(format!("{kind},{payload}"));
        }
    }
}

/// RTP payloader family, used both by the pipeline's payloader tier and by
/// the SDP mangling rules (H.264/H.265 get the profile-level-id patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloaderKind {
    H264,
    H265,
    Vp,
    Av1,
}

impl From<crate::pipeline::PayloaderFamily> for PayloaderKind {
    fn from(f: crate::pipeline::PayloaderFamily) -> Self {
        match f {
            crate::pipeline::PayloaderFamily::H264 => PayloaderKind::H264,
            crate::pipeline::PayloaderFamily::H265 => PayloaderKind::H265,
            crate::pipeline::PayloaderFamily::Vp => PayloaderKind::Vp,
            crate::pipeline::PayloaderFamily::Av1 => PayloaderKind::Av1,
        }
    }
}

/// Normalizes a configured STUN server string into the `stun://host:port`
/// form `webrtcbin`'s `stun-server` property expects.
pub fn normalize_stun_server(stun_server: &str) -> String {
    if stun_server.starts_with("stun://") {
        stun_server.to_string()
    } else if let Some(rest) = stun_server.strip_prefix("stun:") {
        format!("stun://{rest}")
    } else {
        format!("stun://{stun_server}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_scheme() {
        assert_eq!(
            normalize_stun_server("stun.l.google.com:19302"),
            "stun://stun.l.google.com:19302"
        );
    }

    #[test]
    fn normalize_rewrites_bare_stun_scheme() {
        assert_eq!(
            normalize_stun_server("stun:stun.l.google.com:19302"),
            "stun://stun.l.google.com:19302"
        );
    }

    #[test]
    fn normalize_is_noop_for_correct_scheme() {
        let s = "stun://stun.l.google.com:19302";
        assert_eq!(normalize_stun_server(s), s);
    }
}
