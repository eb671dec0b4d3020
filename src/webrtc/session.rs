//! WebRTC session orchestrator: one peer connection's negotiation state
//! machine, ICE trickle, congestion control, and data channel wiring.
//!
//! Uses a `Promise`-over-`mpsc` idiom for `create-answer`, an ICE candidate
//! forwarding channel, and ordered `cleanup`/`Drop` pad release. Generalises
//! across the full [`crate::pipeline::EncoderProfile`] matrix and adds the
//! negotiation state machine, SDP mangling hook, congestion-control aux
//! sender, and data channel.

use futures_util::{SinkExt, StreamExt};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_rtp as gst_rtp;
use gstreamer_rtp::prelude::*;
use gstreamer_sdp as gst_sdp;
use gstreamer_webrtc as gst_webrtc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use super::sdp::mangle_offer_sdp;
use super::{normalize_stun_server, ControlChannel, PayloaderKind};
use crate::config::WebRtcConfig;
use crate::error::SessionError;
use crate::input::router::parse as parse_input_op;
use crate::pipeline::bus::{poll_bus_loop, BusEvent};
use crate::pipeline::VideoPipeline;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    AwaitingAnswer,
    Connecting,
    Connected,
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

pub struct WebRtcSession {
    id: u64,
    webrtcbin: gst::Element,
    queue: gst::Element,
    payloader: gst::Element,
    payloader_kind: PayloaderKind,
    tee_pad: gst::Pad,
    pipeline: gst::Pipeline,
    state: Arc<Mutex<SessionState>>,
    fec_audio_bitrate: u32,
    video: Arc<Mutex<VideoPipeline>>,
    control: ControlChannel,
    data_channel: Option<gst_webrtc::WebRTCDataChannel>,
}

impl WebRtcSession {
    /// Creates the webrtcbin + queue + payloader chain and links it onto the
    /// shared pipeline's tee, mirroring `WebRTCClient::new`.
    pub fn new(
        id: u64,
        video: Arc<Mutex<VideoPipeline>>,
        webrtc_cfg: &WebRtcConfig,
        payloader_kind: PayloaderKind,
        payload_type: u32,
        encoding_name: &str,
        fec_audio_bitrate: u32,
        audio_packetloss_percent: f64,
        audio_channels: i32,
    ) -> Result<Self, SessionError> {
        let pipeline = video.lock().pipeline().clone();

        let webrtcbin = gst::ElementFactory::make("webrtcbin")
            .name(format!("webrtc_{id}"))
            .property("stun-server", normalize_stun_server(&webrtc_cfg.stun_server))
            .property_from_str("bundle-policy", "max-bundle")
            .property("latency", 200u32)
            .property("async-handling", true)
            .property("do-retransmission", false)
            .build()
            .map_err(|e| SessionError::Pipeline(crate::error::PipelineError::ElementCreate("webrtcbin".into(), e.to_string())))?;

        let queue = gst::ElementFactory::make("queue")
            .name(format!("queue_{id}"))
            .property("max-size-buffers", 20u32)
            .property("max-size-time", gst::ClockTime::from_seconds(1))
            .property("max-size-bytes", 2_000_000u32)
            .property_from_str("leaky", "downstream")
            .build()
            .map_err(|e| SessionError::Pipeline(crate::error::PipelineError::ElementCreate("queue".into(), e.to_string())))?;

        let payloader = create_payloader(id, payloader_kind, payload_type)
            .map_err(SessionError::Pipeline)?;
        install_rtp_extensions(&payloader, webrtc_cfg.congestion_control, true);
        let payloader_caps = create_rtp_caps(payloader_kind, payload_type, encoding_name);
        let payloader_capsfilter = gst::ElementFactory::make("capsfilter")
            .name(format!("rtpcaps_{id}"))
            .property("caps", &payloader_caps)
            .build()
            .map_err(|e| SessionError::Pipeline(crate::error::PipelineError::ElementCreate("capsfilter".into(), e.to_string())))?;

        pipeline
            .add_many([&queue, &payloader, &payloader_capsfilter, &webrtcbin])
            .map_err(|e| SessionError::Pipeline(crate::error::PipelineError::Link { from: "pipeline".into(), to: e.to_string() }))?;

        let tee_pad = video.lock().tee().request_pad_simple("src_%u").ok_or_else(|| {
            SessionError::Pipeline(crate::error::PipelineError::Link {
                from: "tee".into(),
                to: "queue".into(),
            })
        })?;
        let queue_sink = queue.static_pad("sink").expect("queue has a static sink pad");
        tee_pad
            .link(&queue_sink)
            .map_err(|_| SessionError::Pipeline(crate::error::PipelineError::Link { from: "tee".into(), to: "queue".into() }))?;

        gst::Element::link_many([&queue, &payloader, &payloader_capsfilter])
            .map_err(|_| SessionError::Pipeline(crate::error::PipelineError::Link { from: "queue".into(), to: "payloader".into() }))?;

        let pay_src = payloader_capsfilter.static_pad("src").expect("capsfilter has a static src pad");
        let webrtc_sink = webrtcbin.request_pad_simple("sink_%u").ok_or_else(|| {
            SessionError::Pipeline(crate::error::PipelineError::Link {
                from: "payloader".into(),
                to: "webrtcbin".into(),
            })
        })?;
        pay_src
            .link(&webrtc_sink)
            .map_err(|_| SessionError::Pipeline(crate::error::PipelineError::Link { from: "payloader".into(), to: "webrtcbin".into() }))?;

        for element in [&queue, &payloader, &payloader_capsfilter, &webrtcbin] {
            element
                .sync_state_with_parent()
                .map_err(|e| SessionError::Pipeline(crate::error::PipelineError::StateChange(e.to_string())))?;
        }

        crate::pipeline::audio::build_webrtc_audio_chain(
            &pipeline,
            &webrtcbin,
            fec_audio_bitrate,
            audio_packetloss_percent,
            audio_channels,
            webrtc_cfg.congestion_control,
        )?;

        let control = ControlChannel::default();

        if webrtc_cfg.congestion_control {
            install_congestion_control(&webrtcbin, id, video.clone(), control.clone(), fec_audio_bitrate);
        }

        let data_channel_options = gst::Structure::builder("data-channel-options")
            .field("ordered", true)
            .field("priority", "high")
            .field("max-retransmits", 0u32)
            .build();
        let data_channel = webrtcbin
            .emit_by_name::<Option<gst_webrtc::WebRTCDataChannel>>("create-data-channel", &[&"input", &Some(data_channel_options)]);
        if let Some(channel) = &data_channel {
            control.set(channel.clone());
        } else {
            warn!(session_id = id, "webrtcbin did not return a data channel handle");
        }

        debug!(session_id = id, "webrtc session elements linked");

        Ok(WebRtcSession {
            id,
            webrtcbin,
            queue,
            payloader,
            payloader_kind,
            tee_pad,
            pipeline,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            fec_audio_bitrate,
            video,
            control,
            data_channel,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Hands the session's [`ControlChannel`] to the caller so cursor/clipboard
    /// monitors spawned alongside this session can publish onto the same data
    /// channel once it opens.
    pub fn control_channel(&self) -> ControlChannel {
        self.control.clone()
    }

    /// Runs the signaling loop over an accepted TCP stream until the client
    /// disconnects or a fatal protocol/SDP error occurs. `session` receives
    /// dispatched input-router operations once the data channel is open.
    pub async fn run(self, stream: TcpStream, session: Arc<Session>) -> Result<(), SessionError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let (ws_tx, mut ws_rx) = ws_stream.split();
        let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));

        let (ice_tx, mut ice_rx) = mpsc::unbounded_channel::<(u32, String)>();
        self.webrtcbin.connect("on-ice-candidate", false, move |values| {
            let mline = values[1].get::<u32>().ok()?;
            let candidate = values[2].get::<String>().ok()?;
            let _ = ice_tx.send((mline, candidate));
            None
        });

        let ws_tx_ice = ws_tx.clone();
        let session_id = self.id;
        tokio::spawn(async move {
            while let Some((mline, candidate)) = ice_rx.recv().await {
                let msg = serde_json::json!({
                    "iceCandidate": { "candidate": candidate, "sdpMLineIndex": mline }
                });
                let mut tx = ws_tx_ice.lock().await;
                if tx.send(Message::Text(msg.to_string())).await.is_err() {
                    warn!(session_id, "failed to forward ICE candidate, client gone");
                    break;
                }
            }
        });

        self.install_data_channel_handler(session.clone());
        self.install_bus_poll(session.cancel_token());

        *self.state.lock() = SessionState::Offering;

        let session_cancel = session.cancel_token();
        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => {
                    info!(session_id = self.id, "session ending, pipeline reported eos/error");
                    break;
                }
                msg = ws_rx.next() => {
                    let Some(msg) = msg else { break };
                    let msg = msg.map_err(|e| SessionError::Transport(e.to_string()))?;
                    let Message::Text(text) = msg else { continue };
                    let value: serde_json::Value =
                        serde_json::from_str(&text).map_err(|e| SessionError::Protocol(e.to_string()))?;

                    if let Some(offer) = value.get("offer") {
                        self.handle_offer(offer, &ws_tx).await?;
                        *self.state.lock() = SessionState::Connecting;
                    } else if let Some(ice) = value.get("iceCandidate") {
                        self.handle_ice_candidate(ice)?;
                    } else {
                        return Err(SessionError::Protocol(format!("unrecognized message shape: {text}")));
                    }
                }
            }
        }

        Ok(())
    }

    /// Polls the session's pipeline bus and reacts to the subset of events
    /// that need a cross-thread decision: `Latency` reprograms `webrtcbin`'s
    /// `latency` property to 0 (so it doesn't add its own buffering on top of
    /// the jitter buffer); `Eos`, `Error`, and a source element dropping back
    /// to `READY` all cancel the session.
    fn install_bus_poll(&self, cancel: tokio_util::sync::CancellationToken) {
        let Some(bus) = self.pipeline.bus() else { return };
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_bus_loop(bus, None, tx));

        let webrtcbin = self.webrtcbin.clone();
        let session_id = self.id;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BusEvent::Latency => webrtcbin.set_property("latency", 0u32),
                    BusEvent::Eos => {
                        info!(session_id, "pipeline eos, ending session");
                        cancel.cancel();
                        break;
                    }
                    BusEvent::Error(msg) => {
                        warn!(session_id, error = msg, "pipeline error, ending session");
                        cancel.cancel();
                        break;
                    }
                    BusEvent::SourceWentToReady => {
                        info!(session_id, "pipeline source dropped to READY, ending session");
                        cancel.cancel();
                        break;
                    }
                }
            }
        });
    }

    async fn handle_offer(&self, offer: &serde_json::Value, ws_tx: &Arc<tokio::sync::Mutex<WsSink>>) -> Result<(), SessionError> {
        let offer_type = offer.get("type").and_then(|v| v.as_str());
        if offer_type != Some("offer") {
            return Err(SessionError::SdpViolation(format!("expected type \"offer\", got {offer_type:?}")));
        }
        let sdp_str = offer
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SessionError::Protocol("offer missing sdp field".into()))?;

        let sdp = gst_sdp::SDPMessage::parse_buffer(sdp_str.as_bytes())
            .map_err(|_| SessionError::SdpViolation("failed to parse offer SDP".into()))?;
        let offer_desc = gst_webrtc::WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Offer, sdp);

        let promise = gst::Promise::with_change_func(|_| {});
        self.webrtcbin.emit_by_name::<()>("set-remote-description", &[&offer_desc, &promise]);
        promise.wait();

        let (tx, rx) = std::sync::mpsc::channel();
        let answer_promise = gst::Promise::with_change_func(move |reply| {
            let _ = tx.send(reply.map(|r| r.to_owned()));
        });
        self.webrtcbin
            .emit_by_name::<()>("create-answer", &[&None::<gst::Structure>, &answer_promise]);

        let reply = rx
            .recv()
            .map_err(|_| SessionError::SdpViolation("answer promise channel closed".into()))?
            .map_err(|e| SessionError::SdpViolation(format!("create-answer failed: {e:?}")))?;
        let answer = reply
            .value("answer")
            .map_err(|_| SessionError::SdpViolation("no answer field in reply".into()))?
            .get::<gst_webrtc::WebRTCSessionDescription>()
            .map_err(|_| SessionError::SdpViolation("answer field has wrong type".into()))?;

        let local_promise = gst::Promise::with_change_func(|_| {});
        self.webrtcbin
            .emit_by_name::<()>("set-local-description", &[&answer, &local_promise]);
        local_promise.wait();

        let raw_sdp_text = answer
            .sdp()
            .as_text()
            .map_err(|_| SessionError::SdpViolation("answer SDP has no text form".into()))?;
        let mangled = mangle_offer_sdp(&raw_sdp_text, self.payloader_kind);

        let msg = serde_json::json!({ "answer": { "type": "answer", "sdp": mangled } });
        let mut tx = ws_tx.lock().await;
        tx.send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        info!(session_id = self.id, "sdp answer sent");
        Ok(())
    }

    fn handle_ice_candidate(&self, ice: &serde_json::Value) -> Result<(), SessionError> {
        let candidate = ice
            .get("candidate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SessionError::Protocol("ice candidate missing 'candidate'".into()))?;
        let mline = ice
            .get("sdpMLineIndex")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SessionError::Protocol("ice candidate missing 'sdpMLineIndex'".into()))? as u32;

        self.webrtcbin.emit_by_name::<()>("add-ice-candidate", &[&mline, &candidate]);
        Ok(())
    }

    /// Wires `open`/`close`/`error`/`on-message-string` on the data channel
    /// the server created in `new()`. Received strings are parsed by the
    /// input router and dispatched to `session`; the channel's own handle
    /// is already published on `self.control` so the session's other
    /// subsystems (cursor/clipboard monitors, bitrate confirmations) can
    /// publish back once it reaches `Open`.
    fn install_data_channel_handler(&self, session: Arc<Session>) {
        let Some(channel) = self.data_channel.as_ref() else { return };
        let session_id = self.id;
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = msg_rx.recv().await {
                let op = parse_input_op(&text);
                session.handle_input_op(op).await;
            }
        });

        channel.connect("on-open", false, move |_| {
            info!(session_id, "data channel open");
            None
        });
        let tx = msg_tx.clone();
        channel.connect("on-message-string", false, move |values| {
            if let Ok(text) = values[1].get::<String>() {
                let _ = tx.send(text);
            }
            None
        });
        channel.connect("on-close", false, move |_| {
            debug!(session_id, "data channel closed");
            None
        });
        channel.connect("on-error", false, move |values| {
            warn!(session_id, error = ?values.get(1), "data channel error");
            None
        });
    }

    pub fn fec_audio_bitrate(&self) -> u32 {
        self.fec_audio_bitrate
    }

    async fn cleanup(&self) {
        let _ = self.webrtcbin.set_state(gst::State::Ready);
        let _ = self.payloader.set_state(gst::State::Ready);
        let _ = self.queue.set_state(gst::State::Ready);

        if let Some(queue_sink) = self.queue.static_pad("sink") {
            let _ = self.tee_pad.unlink(&queue_sink);
        }
        if let Some(tee) = self.tee_pad.parent_element() {
            tee.release_request_pad(&self.tee_pad);
        }

        let _ = self.webrtcbin.set_state(gst::State::Null);
        let _ = self.queue.set_state(gst::State::Null);
        let _ = self.pipeline.remove_many([&self.queue, &self.payloader, &self.webrtcbin]);

        debug!(session_id = self.id, "webrtc session cleaned up");
    }
}

impl Drop for WebRtcSession {
    fn drop(&mut self) {
        debug!(session_id = self.id, "dropping webrtc session");
        let _ = self.webrtcbin.set_state(gst::State::Null);
        let _ = self.payloader.set_state(gst::State::Null);
        let _ = self.queue.set_state(gst::State::Null);
        if let Some(queue_sink) = self.queue.static_pad("sink") {
            let _ = self.tee_pad.unlink(&queue_sink);
        }
        if let Some(tee) = self.tee_pad.parent_element() {
            tee.release_request_pad(&self.tee_pad);
        }
        let _ = self.pipeline.remove_many([&self.queue, &self.payloader, &self.webrtcbin]);
    }
}

fn create_payloader(id: u64, kind: PayloaderKind, payload_type: u32) -> Result<gst::Element, crate::error::PipelineError> {
    let factory = match kind {
        PayloaderKind::H264 => "rtph264pay",
        PayloaderKind::H265 => "rtph265pay",
        PayloaderKind::Vp => "rtpvp8pay",
        PayloaderKind::Av1 => "rtpav1pay",
    };
    let builder = gst::ElementFactory::make(factory)
        .name(format!("pay_{id}"))
        .property("mtu", 1200u32)
        .property("pt", payload_type);
    let builder = if matches!(kind, PayloaderKind::H264 | PayloaderKind::H265) {
        builder.property("config-interval", 1i32).property_from_str("aggregate-mode", "zero-latency")
    } else {
        builder
    };
    builder
        .build()
        .map_err(|e| crate::error::PipelineError::ElementCreate(factory.to_string(), e.to_string()))
}

fn create_rtp_caps(kind: PayloaderKind, payload_type: u32, encoding_name: &str) -> gst::Caps {
    let _ = kind;
    gst::Caps::builder("application/x-rtp")
        .field("media", "video")
        .field("encoding-name", encoding_name)
        .field("payload", payload_type as i32)
        .field("clock-rate", 90000i32)
        .build()
}

/// Installs a GCC bandwidth estimator on `request-aux-sender`. Each
/// `estimated-bitrate` notification is posted once onto an mpsc channel and
/// applied from a plain tokio task (never inline in the GLib signal
/// callback), which calls `VideoPipeline::set_video_bitrate(.., cc_triggered
/// = true)` with `estimated - fec_audio_bitrate` (both already in bps) and
/// publishes a `pipeline` control message with the new value, per the
/// runtime bitrate setter's "publish on success" rule.
fn install_congestion_control(
    webrtcbin: &gst::Element,
    session_id: u64,
    video: Arc<Mutex<VideoPipeline>>,
    control: ControlChannel,
    fec_audio_bitrate: u32,
) {
    let (bitrate_tx, mut bitrate_rx) = mpsc::unbounded_channel::<u32>();

    tokio::spawn(async move {
        while let Some(estimated_bps) = bitrate_rx.recv().await {
            let adjusted = estimated_bps.saturating_sub(fec_audio_bitrate);
            video.lock().set_video_bitrate(adjusted, true, fec_audio_bitrate);
            control.send_json(&serde_json::json!({
                "type": "pipeline",
                "data": format!("Video bitrate set to: {adjusted}"),
            }));
        }
    });

    webrtcbin.connect("request-aux-sender", false, move |values| {
        let transport = values[1].get::<gst::glib::Object>().ok()?;
        let estimator = gst::ElementFactory::make("rtpgccbwe").build().ok()?;
        estimator.set_property("estimated-bitrate", 2_000_000u32);

        let tx = bitrate_tx.clone();
        estimator.connect_notify(Some("estimated-bitrate"), move |el, _pspec| {
            let bps: u32 = el.property("estimated-bitrate");
            let _ = tx.send(bps);
        });

        debug!(session_id, "installed GCC bandwidth estimator for transport {:?}", transport.type_());
        Some(estimator.to_value())
    });
}

const TWCC_EXTENSION_URI: &str = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
const PLAYOUT_DELAY_EXTENSION_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

/// Registers RTP header extensions on a payloader: transport-wide congestion
/// control when enabled (both audio and video), and playout-delay for video
/// only, matching `rtp_add_extensions(payloader, audio=...)`'s URI list.
/// Both URIs resolve to extension implementations already shipped by
/// `gstreamer-plugins-good`'s `rtpmanager`, so no custom
/// `RTPHeaderExtension` subclass is needed here.
pub(crate) fn install_rtp_extensions(payloader: &gst::Element, congestion_control: bool, video: bool) {
    let mut uris = Vec::new();
    if congestion_control {
        uris.push(TWCC_EXTENSION_URI);
    }
    if video {
        uris.push(PLAYOUT_DELAY_EXTENSION_URI);
    }

    let mut previous_id = 0u32;
    for uri in uris {
        let Some(id) = pick_rtp_extension_id(payloader, uri, previous_id) else { continue };
        let Some(extension) = gst_rtp::RTPHeaderExtension::create_from_uri(uri) else {
            warn!(uri, "no RTP header extension implementation registered for this URI");
            continue;
        };
        extension.set_id(id);
        payloader.emit_by_name::<()>("add-extension", &[&extension]);
        previous_id = id;
    }
}

/// If the payloader exposes its current extension list, picks the smallest
/// positive id not already in use (or `None` if `uri` is already registered
/// on it); otherwise picks `previous_id + 1`, leaving id 0 unused.
fn pick_rtp_extension_id(payloader: &gst::Element, uri: &str, previous_id: u32) -> Option<u32> {
    let Ok(existing) = payloader.try_property::<Vec<gst_rtp::RTPHeaderExtension>>("extensions") else {
        return Some(previous_id + 1);
    };

    if existing.iter().any(|ext| ext.uri().as_deref() == Some(uri)) {
        return None;
    }

    let used: std::collections::HashSet<u32> = existing.iter().map(|ext| ext.id()).collect();
    (1u32..).find(|n| !used.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_starts_idle() {
        let state = Arc::new(Mutex::new(SessionState::Idle));
        assert_eq!(*state.lock(), SessionState::Idle);
    }
}
