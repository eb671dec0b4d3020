//! Audio pipeline: the PulseAudio monitor-source capture chain that runs
//! alongside the video pipeline — an optional second pipeline in WebSocket
//! mode (WebRTC mode combines video and audio onto the same `webrtcbin`).

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;

use crate::error::{PipelineError, SessionError};
use crate::transport::ws_framer::encode_audio_frame;

const AUDIO_RTP_PAYLOAD_TYPE: i32 = 111;
const AUDIO_CLOCK_RATE: i32 = 48000;

/// Builds the WebRTC-mode audio chain (`pulsesrc → capsfilter → opusenc →
/// rtpopuspay → queue → capsfilter`) and links it directly onto `webrtcbin`,
/// mirroring `build_audio_pipeline`'s flat `Gst.Element.link` chain (no tee:
/// WebRTC mode has exactly one audio consumer).
pub fn build_webrtc_audio_chain(
    pipeline: &gst::Pipeline,
    webrtcbin: &gst::Element,
    audio_bitrate_bps: u32,
    audio_packetloss_percent: f64,
    audio_channels: i32,
    congestion_control: bool,
) -> Result<(), SessionError> {
    let pulsesrc = make("pulsesrc", "pulsesrc")?;
    pulsesrc.set_property("provide-clock", true);
    pulsesrc.set_property("do-timestamp", false);
    pulsesrc.set_property("buffer-time", 100_000i64);
    pulsesrc.set_property("latency-time", 1_000i64);

    let caps = gst::Caps::builder("audio/x-raw").field("channels", audio_channels).build();
    let capsfilter = make("capsfilter", "audio-caps")?;
    capsfilter.set_property("caps", &caps);

    let opusenc = build_opusenc(audio_bitrate_bps, audio_packetloss_percent, "cbr", 10)?;

    let rtpopuspay = make("rtpopuspay", "rtpopuspay")?;
    rtpopuspay.set_property("mtu", 1200u32);
    crate::webrtc::session::install_rtp_extensions(&rtpopuspay, congestion_control, false);

    let queue = make("queue", "rtpopuspay-queue")?;
    queue.set_property_from_str("leaky", "downstream");
    queue.set_property("flush-on-eos", true);
    queue.set_property("max-size-time", 16_000_000u64);
    queue.set_property("max-size-buffers", 0u32);
    queue.set_property("max-size-bytes", 0u32);

    let rtp_caps = gst::Caps::builder("application/x-rtp")
        .field("media", "audio")
        .field("encoding-name", "OPUS")
        .field("payload", AUDIO_RTP_PAYLOAD_TYPE)
        .field("clock-rate", AUDIO_CLOCK_RATE)
        .build();
    let rtp_capsfilter = make("capsfilter", "rtpopuspay-caps")?;
    rtp_capsfilter.set_property("caps", &rtp_caps);

    let elements = [&pulsesrc, &capsfilter, &opusenc, &rtpopuspay, &queue, &rtp_capsfilter];
    pipeline
        .add_many(elements)
        .map_err(|e| SessionError::Pipeline(PipelineError::Link { from: "pipeline".into(), to: e.to_string() }))?;
    gst::Element::link_many(elements)
        .map_err(|_| SessionError::Pipeline(PipelineError::Link { from: "audio-chain".into(), to: "rtpopuspay-caps".into() }))?;

    let sink_pad = webrtcbin.request_pad_simple("sink_%u").ok_or_else(|| {
        SessionError::Pipeline(PipelineError::Link { from: "audio-chain".into(), to: "webrtcbin".into() })
    })?;
    let src_pad = rtp_capsfilter.static_pad("src").expect("capsfilter has a static src pad");
    src_pad
        .link(&sink_pad)
        .map_err(|_| SessionError::Pipeline(PipelineError::Link { from: "rtpopuspay-caps".into(), to: "webrtcbin".into() }))?;

    for element in elements {
        element
            .sync_state_with_parent()
            .map_err(|e| SessionError::Pipeline(PipelineError::StateChange(e.to_string())))?;
    }
    Ok(())
}

/// The reduced WebSocket-mode audio pipeline: `pulsesrc → queue →
/// audioconvert → audioresample → capsfilter → opusenc → queue → appsink`,
/// a direct port of `build_audio_ws_pipeline`'s `Gst.parse_launch` string.
pub struct AudioWsPipeline {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl AudioWsPipeline {
    pub fn new(audio_bitrate_bps: u32, audio_channels: i32) -> Result<Self, PipelineError> {
        let pipeline = gst::Pipeline::builder().name("ws-session-audio").build();

        let pulsesrc = make("pulsesrc", "source")?;
        pulsesrc.set_property("device", "output.monitor");
        let queue1 = make("queue", "audio-queue-in")?;
        let convert = make("audioconvert", "convert")?;
        let resample = make("audioresample", "resample")?;

        let caps = gst::Caps::builder("audio/x-raw")
            .field("channels", audio_channels)
            .field("rate", AUDIO_CLOCK_RATE)
            .build();
        let capsfilter = make("capsfilter", "audioconvert-caps")?;
        capsfilter.set_property("caps", &caps);

        let opusenc = build_opusenc(audio_bitrate_bps, 0.0, "vbr", 20)?;
        opusenc.set_property("dtx", true);

        let queue2 = make("queue", "audio-queue-out")?;

        let sink_el = make("appsink", "sink")?;
        sink_el.set_property("sync", false);
        sink_el.set_property("emit-signals", true);
        let appsink = sink_el
            .clone()
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::ElementCreate("appsink".into(), "downcast failed".into()))?;

        let elements = [&pulsesrc, &queue1, &convert, &resample, &capsfilter, &opusenc, &queue2, &sink_el];
        pipeline
            .add_many(elements)
            .map_err(|e| PipelineError::Link { from: "pipeline".into(), to: e.to_string() })?;
        gst::Element::link_many(elements)
            .map_err(|_| PipelineError::Link { from: "audio-source-chain".into(), to: "appsink".into() })?;

        Ok(AudioWsPipeline { pipeline, appsink })
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PipelineError> {
        self.pipeline.set_state(gst::State::Null).map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    pub fn pipeline_bus(&self) -> Option<gst::Bus> {
        self.pipeline.bus()
    }

    /// Frames every pulled Opus packet and posts it once onto `tx`.
    pub fn install_sample_callback(&self, tx: mpsc::UnboundedSender<bytes::Bytes>) {
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let framed = encode_audio_frame(map.as_slice());
                    if tx.send(framed).is_err() {
                        return Err(gst::FlowError::Eos);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }
}

fn build_opusenc(bitrate_bps: u32, packetloss_percent: f64, bitrate_type: &str, frame_size_ms: i32) -> Result<gst::Element, PipelineError> {
    let opusenc = make("opusenc", "opusenc")?;
    opusenc.set_property_from_str("audio-type", "restricted-lowdelay");
    opusenc.set_property_from_str("bandwidth", "fullband");
    opusenc.set_property_from_str("bitrate-type", bitrate_type);
    opusenc.set_property("frame-size", frame_size_ms);
    opusenc.set_property("perfect-timestamp", true);
    opusenc.set_property("max-payload-size", 4000i32);
    opusenc.set_property("inband-fec", packetloss_percent > 0.0);
    opusenc.set_property("packet-loss-percentage", packetloss_percent as i32);
    opusenc.set_property("bitrate", bitrate_bps as i32);
    Ok(opusenc)
}

fn make(factory: &str, name: &str) -> Result<gst::Element, PipelineError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| PipelineError::ElementCreate(factory.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_rtp_constants_match_standard_opus_profile() {
        assert_eq!(AUDIO_RTP_PAYLOAD_TYPE, 111);
        assert_eq!(AUDIO_CLOCK_RATE, 48000);
    }
}
