//! WebSocket-mode pipeline: the reduced `display-source → queue →
//! [conversion] → encoder → codec-capsfilter → queue → appsink` graph used
//! when a client has no WebRTC transport. Supported encoders are the
//! restricted {x264, nvh264, vah264, openh264} subset.
//!
//! The pull-sample loop reuses a scratch buffer across samples and bridges
//! GStreamer's `new-sample` callback onto the owning loop through a
//! "post-once" `mpsc` primitive rather than blocking the callback thread.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{fec_bitrate, gop_size, vbv_buffer_size, EncoderFamily, EncoderProfile};
use crate::config::{KeyframeDistance, SessionDefaults};
use crate::error::PipelineError;
use crate::transport::ws_framer::{encode_video_frame, FpsCounter, FrameIdCounter};

/// Encoders the reduced WebSocket pipeline supports; anything else is
/// rejected up front rather than silently falling back.
pub fn supports(profile: EncoderProfile) -> bool {
    matches!(profile, EncoderProfile::X264 | EncoderProfile::NvH264 | EncoderProfile::VaH264 | EncoderProfile::OpenH264)
}

pub struct WsVideoPipeline {
    pipeline: gst::Pipeline,
    source: gst::Element,
    source_capsfilter: gst::Element,
    encoder: gst::Element,
    appsink: gst_app::AppSink,
    profile: EncoderProfile,
    framerate: i32,
    video_bitrate_bps: u32,
    loss_pct: f64,
    keyframe_distance: KeyframeDistance,
    _bus_watch: Option<gst::bus::BusWatchGuard>,
}

impl WsVideoPipeline {
    pub fn new(defaults: &SessionDefaults, test_mode: bool) -> Result<Self, PipelineError> {
        if !supports(defaults.encoder) {
            return Err(PipelineError::UnsupportedEncoder(defaults.encoder));
        }

        let pipeline = gst::Pipeline::builder().name("ws-session-video").build();

        let source = if test_mode {
            gst::ElementFactory::make("videotestsrc").name("source").build()
        } else {
            gst::ElementFactory::make("ximagesrc").name("source").build()
        }
        .map_err(|e| PipelineError::ElementCreate("source".into(), e.to_string()))?;
        if !test_mode {
            source.set_property("show-pointer", true);
            source.set_property("remote", true);
            source.set_property("blocksize", 16384u32);
            source.set_property("use-damage", false);
        }

        let source_caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(defaults.framerate, 1))
            .build();
        let source_capsfilter = super::make_element("capsfilter", "ws-source-caps")?;
        source_capsfilter.set_property("caps", &source_caps);

        let queue_in = super::make_element("queue", "ws-queue-in")?;
        let conversion = super::build_conversion_tier(&pipeline, defaults.encoder, defaults.gpu_index, "ws")?;
        let encoder = super::encoder::create_encoder(
            defaults.encoder,
            defaults.video_bitrate_bps,
            defaults.video_packetloss_percent,
            defaults.framerate,
            defaults.keyframe_distance,
        )?;
        let caps = codec_caps(defaults.encoder);
        let capsfilter = super::make_element("capsfilter", "ws-codec-caps")?;
        capsfilter.set_property("caps", &caps);
        let queue_out = super::make_element("queue", "ws-queue-out")?;

        let sink_el = super::make_element("appsink", "ws-sink")?;
        sink_el.set_property("sync", false);
        sink_el.set_property("emit-signals", true);
        let appsink = sink_el
            .clone()
            .downcast::<gst_app::AppSink>()
            .map_err(|_| PipelineError::ElementCreate("appsink".into(), "downcast failed".into()))?;

        pipeline
            .add_many([&source, &source_capsfilter, &queue_in, &encoder, &capsfilter, &queue_out, &sink_el])
            .map_err(|e| PipelineError::Link { from: "pipeline".into(), to: e.to_string() })?;
        gst::Element::link_many([&source, &source_capsfilter, &queue_in]).map_err(|_| {
            PipelineError::Link { from: "source-chain".into(), to: "queue-in".into() }
        })?;
        queue_in.link(conversion.first().expect("conversion tier is non-empty")).map_err(|_| {
            PipelineError::Link { from: "queue-in".into(), to: "conversion-tier".into() }
        })?;
        conversion.last().expect("conversion tier is non-empty").link(&encoder).map_err(|_| {
            PipelineError::Link { from: "conversion-tier".into(), to: "encoder".into() }
        })?;
        gst::Element::link_many([&encoder, &capsfilter, &queue_out, &sink_el])
            .map_err(|_| PipelineError::Link { from: "encoder".into(), to: "appsink".into() })?;

        let bus_watch = super::bus::install_bus_watch(&pipeline);

        Ok(WsVideoPipeline {
            pipeline,
            source,
            source_capsfilter,
            encoder,
            appsink,
            profile: defaults.encoder,
            framerate: defaults.framerate,
            video_bitrate_bps: defaults.video_bitrate_bps,
            loss_pct: defaults.video_packetloss_percent,
            keyframe_distance: defaults.keyframe_distance,
            _bus_watch: bus_watch,
        })
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    /// Recomputes the FEC-adjusted bitrate and VBV buffer and writes both to
    /// the encoder, mirroring [`super::VideoPipeline::set_video_bitrate`]
    /// (there is no GCC estimator to reprogram in WebSocket mode, so there is
    /// no return value to act on).
    pub fn set_video_bitrate(&mut self, bps: u32) {
        self.video_bitrate_bps = bps;
        let fec_bps = fec_bitrate(bps, self.loss_pct);
        super::encoder::apply_bitrate(&self.encoder, self.profile, fec_bps);
        let vbv = vbv_buffer_size(fec_bps, self.framerate, self.keyframe_distance);
        super::encoder::apply_vbv(&self.encoder, self.profile, vbv);
        debug!(bps, fec_bps, "ws video bitrate updated");
    }

    pub fn set_framerate(&mut self, fps: i32) {
        self.framerate = fps;
        let fec_bps = fec_bitrate(self.video_bitrate_bps, self.loss_pct);
        let gop = gop_size(fps, self.keyframe_distance);
        super::encoder::apply_gop(&self.encoder, self.profile, gop);
        let vbv = vbv_buffer_size(fec_bps, fps, self.keyframe_distance);
        super::encoder::apply_vbv(&self.encoder, self.profile, vbv);

        let caps = gst::Caps::builder("video/x-raw").field("framerate", gst::Fraction::new(fps, 1)).build();
        self.source_capsfilter.set_property("caps", &caps);
    }

    pub fn set_pointer_visible(&self, visible: bool) {
        if self.source.has_property("show-pointer", None) {
            self.source.set_property("show-pointer", visible);
        } else {
            warn!("source element has no show-pointer property");
        }
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PipelineError> {
        self.pipeline.set_state(gst::State::Null).map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    /// Installs the `new-sample` callback. Every pulled sample is framed and
    /// posted once onto `tx`; `fps_tx` receives a new FPS figure every 2s.
    pub fn install_sample_callback(&self, tx: mpsc::UnboundedSender<bytes::Bytes>, fps_tx: mpsc::UnboundedSender<f64>) {
        let mut frame_ids = FrameIdCounter::default();
        let mut fps = FpsCounter::new();
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let is_keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                    let frame_id = frame_ids.next();
                    let framed = encode_video_frame(frame_id, is_keyframe, map.as_slice());
                    if tx.send(framed).is_err() {
                        return Err(gst::FlowError::Eos);
                    }
                    if let Some(value) = fps.tick() {
                        let _ = fps_tx.send(value);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }
}

fn codec_caps(profile: EncoderProfile) -> gst::Caps {
    match profile.family() {
        EncoderFamily::Nvidia | EncoderFamily::Va | EncoderFamily::SoftwareH26x => {
            gst::Caps::builder("video/x-h264").field("stream-format", "byte-stream").field("alignment", "au").build()
        }
        _ => {
            debug!(?profile, "unexpected encoder family reached ws codec caps, defaulting to h264 caps");
            gst::Caps::builder("video/x-h264").build()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_only_the_restricted_encoder_subset() {
        assert!(supports(EncoderProfile::X264));
        assert!(supports(EncoderProfile::NvH264));
        assert!(!supports(EncoderProfile::Vp8));
        assert!(!supports(EncoderProfile::Av1));
    }
}
