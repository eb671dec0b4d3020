//! Media pipeline graph construction: per-encoder-family directed graphs over
//! GStreamer, parameterised by [`EncoderProfile`] and transport mode.

pub mod audio;
pub mod bus;
pub mod encoder;
pub mod ws_sink;

use gstreamer as gst;
use gstreamer::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{KeyframeDistance, SessionDefaults};
use crate::error::PipelineError;

/// Encoder family tag. Carries the plugin set, property formulas, caps, and
/// payloader family for one encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderProfile {
    NvH264,
    NvH265,
    NvAv1,
    VaH264,
    VaH265,
    VaVp9,
    VaAv1,
    X264,
    OpenH264,
    X265,
    Vp8,
    Vp9,
    SvtAv1,
    Av1,
    Rav1e,
}

/// Coarse family grouping used for property-matrix branching (VBV multiplier,
/// bitrate unit conversion, B-frame/lookahead disabling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    Nvidia,
    Va,
    SoftwareH26x,
    Vpx,
    Av1,
}

/// RTP payloader family selection for a given encoder's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloaderFamily {
    H264,
    H265,
    Vp,
    Av1,
}

/// Base plugin set required regardless of encoder, per the plugin preflight.
pub const BASE_PLUGINS: &[&str] = &[
    "opus", "nice", "webrtc", "app", "dtls", "srtp", "rtp", "sctp", "rtpmanager", "ximagesrc",
];

impl EncoderProfile {
    pub fn family(self) -> EncoderFamily {
        use EncoderProfile::*;
        match self {
            NvH264 | NvH265 | NvAv1 => EncoderFamily::Nvidia,
            VaH264 | VaH265 | VaVp9 | VaAv1 => EncoderFamily::Va,
            X264 | OpenH264 | X265 => EncoderFamily::SoftwareH26x,
            Vp8 | Vp9 => EncoderFamily::Vpx,
            SvtAv1 | Av1 | Rav1e => EncoderFamily::Av1,
        }
    }

    pub fn payloader_family(self) -> PayloaderFamily {
        use EncoderProfile::*;
        match self {
            NvH264 | VaH264 | X264 | OpenH264 => PayloaderFamily::H264,
            NvH265 | VaH265 | X265 => PayloaderFamily::H265,
            VaVp9 | Vp8 | Vp9 => PayloaderFamily::Vp,
            NvAv1 | VaAv1 | SvtAv1 | Av1 | Rav1e => PayloaderFamily::Av1,
        }
    }

    /// GStreamer element-factory name for this encoder.
    pub fn element_name(self) -> &'static str {
        use EncoderProfile::*;
        match self {
            NvH264 => "nvh264enc",
            NvH265 => "nvh265enc",
            NvAv1 => "nvav1enc",
            VaH264 => "vah264enc",
            VaH265 => "vah265enc",
            VaVp9 => "vavp9enc",
            VaAv1 => "vaav1enc",
            X264 => "x264enc",
            OpenH264 => "openh264enc",
            X265 => "x265enc",
            Vp8 => "vp8enc",
            Vp9 => "vp9enc",
            SvtAv1 => "svtav1enc",
            Av1 => "av1enc",
            Rav1e => "rav1enc",
        }
    }

    /// Extra plugins beyond [`BASE_PLUGINS`] required for this family.
    pub fn extra_plugins(self) -> &'static [&'static str] {
        match self.family() {
            EncoderFamily::Nvidia => &["nvcodec"],
            EncoderFamily::Va => &["va"],
            EncoderFamily::Av1 => &["rsrtp"],
            EncoderFamily::SoftwareH26x | EncoderFamily::Vpx => &[],
        }
    }

    /// Raw format the color-conversion tier must produce ahead of this encoder.
    pub fn input_format(self) -> &'static str {
        use EncoderProfile::*;
        match self {
            NvH264 | NvH265 | NvAv1 | VaH264 | VaH265 | VaVp9 | VaAv1 | X264 => "NV12",
            OpenH264 | X265 | Vp8 | Vp9 | SvtAv1 | Av1 | Rav1e => "I420",
        }
    }
}

/// Computes the FEC-adjusted video bitrate: `video_bitrate / (1 + loss_pct/100)`.
pub fn fec_bitrate(video_bitrate: u32, loss_pct: f64) -> u32 {
    ((video_bitrate as f64) / (1.0 + loss_pct / 100.0)).round() as u32
}

/// Computes the GOP / keyframe-max-distance property value: `-1` for an
/// infinite keyframe distance, otherwise `max(60, round(framerate * seconds))`.
pub fn gop_size(framerate: i32, keyframe_distance: KeyframeDistance) -> i32 {
    match keyframe_distance {
        KeyframeDistance::Infinite => -1,
        KeyframeDistance::Seconds(secs) => {
            let frames = (framerate as f64 * secs).round() as i32;
            frames.max(60)
        }
    }
}

/// Computes the VBV/CPB buffer size: `ceil(bitrate / framerate) * multiplier`,
/// multiplier 1.5 for an infinite keyframe distance, else 3.0.
pub fn vbv_buffer_size(bitrate: u32, framerate: i32, keyframe_distance: KeyframeDistance) -> u32 {
    let multiplier = match keyframe_distance {
        KeyframeDistance::Infinite => 1.5,
        KeyframeDistance::Seconds(_) => 3.0,
    };
    let per_frame = (bitrate as f64 / framerate.max(1) as f64).ceil();
    (per_frame * multiplier) as u32
}

/// A constructed media pipeline for one session's video path.
///
/// Keeps direct references to the elements that runtime setters must mutate,
/// rather than re-querying the bin by name on every call.
pub struct VideoPipeline {
    pipeline: gst::Pipeline,
    source: gst::Element,
    source_capsfilter: gst::Element,
    encoder: gst::Element,
    tee: gst::Element,
    profile: EncoderProfile,
    framerate: i32,
    video_bitrate_bps: u32,
    loss_pct: f64,
    keyframe_distance: KeyframeDistance,
    _bus_watch: Option<gst::bus::BusWatchGuard>,
}

impl VideoPipeline {
    /// Build a pipeline for the given encoder profile and session defaults.
    ///
    /// `source_element_name` selects between `"x11"` (WebRTC mode) and
    /// `"source"` (WebSocket mode), matching the element name `set_pointer_visible`
    /// and `set_framerate` look up later.
    pub fn new(
        defaults: &SessionDefaults,
        source_element_name: &str,
        test_mode: bool,
    ) -> Result<Self, PipelineError> {
        preflight_plugins(defaults.encoder)?;

        let pipeline = gst::Pipeline::builder().name("session-video").build();

        let source = if test_mode {
            make_element("videotestsrc", source_element_name)?
        } else {
            make_element("ximagesrc", source_element_name)?
        };
        if !test_mode {
            source.set_property("show-pointer", true);
            source.set_property("remote", true);
            source.set_property("blocksize", 16384u32);
            source.set_property("use-damage", false);
        }

        let caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(defaults.framerate, 1))
            .build();
        let source_capsfilter = make_element("capsfilter", "source-caps")?;
        source_capsfilter.set_property("caps", &caps);

        let encoder = encoder::create_encoder(
            defaults.encoder,
            defaults.video_bitrate_bps,
            defaults.video_packetloss_percent,
            defaults.framerate,
            defaults.keyframe_distance,
        )?;

        let tee = make_element("tee", "video-tee")?;
        tee.set_property("allow-not-linked", true);

        let conversion = build_conversion_tier(&pipeline, defaults.encoder, defaults.gpu_index, "video")?;

        pipeline
            .add_many([&source, &source_capsfilter, &encoder, &tee])
            .map_err(|e| PipelineError::Link {
                from: "pipeline".into(),
                to: format!("add_many failed: {e}"),
            })?;
        gst::Element::link_many([&source, &source_capsfilter]).map_err(|_| PipelineError::Link {
            from: "source".into(),
            to: "source-caps".into(),
        })?;
        source_capsfilter.link(conversion.first().expect("conversion tier is non-empty")).map_err(|_| {
            PipelineError::Link { from: "source-caps".into(), to: "conversion-tier".into() }
        })?;
        conversion.last().expect("conversion tier is non-empty").link(&encoder).map_err(|_| PipelineError::Link {
            from: "conversion-tier".into(),
            to: "encoder".into(),
        })?;
        encoder.link(&tee).map_err(|_| PipelineError::Link { from: "encoder".into(), to: "tee".into() })?;

        let bus_watch = bus::install_bus_watch(&pipeline);

        info!(profile = ?defaults.encoder, fps = defaults.framerate, "video pipeline constructed");

        Ok(VideoPipeline {
            pipeline,
            source,
            source_capsfilter,
            encoder,
            tee,
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

    pub fn tee(&self) -> &gst::Element {
        &self.tee
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), PipelineError> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| PipelineError::StateChange(e.to_string()))?;
        Ok(())
    }

    /// Recompute FEC bitrate, write it to the encoder, and (unless
    /// `cc_triggered`) return the GCC bitrate triple the caller should
    /// re-program on the bandwidth estimator.
    pub fn set_video_bitrate(&mut self, bps: u32, cc_triggered: bool, fec_audio_bitrate: u32) -> Option<(u32, u32, u32)> {
        self.video_bitrate_bps = bps;
        let fec_bps = fec_bitrate(bps, self.loss_pct);
        encoder::apply_bitrate(&self.encoder, self.profile, fec_bps);

        let vbv = vbv_buffer_size(fec_bps, self.framerate, self.keyframe_distance);
        encoder::apply_vbv(&self.encoder, self.profile, vbv);

        debug!(bps, fec_bps, cc_triggered, "video bitrate updated");

        if cc_triggered {
            None
        } else {
            let min = (100_000 + fec_audio_bitrate).max((bps as f64 * 0.1) as u32 + fec_audio_bitrate);
            let max = bps + fec_audio_bitrate;
            Some((min, max, max))
        }
    }

    pub fn set_framerate(&mut self, fps: i32) {
        self.framerate = fps;
        let fec_bps = fec_bitrate(self.video_bitrate_bps, self.loss_pct);
        let gop = gop_size(fps, self.keyframe_distance);
        encoder::apply_gop(&self.encoder, self.profile, gop);
        let vbv = vbv_buffer_size(fec_bps, fps, self.keyframe_distance);
        encoder::apply_vbv(&self.encoder, self.profile, vbv);

        let caps = gst::Caps::builder("video/x-raw")
            .field("framerate", gst::Fraction::new(fps, 1))
            .build();
        self.source_capsfilter.set_property("caps", &caps);
    }

    pub fn set_pointer_visible(&self, visible: bool) {
        if self.source.has_property("show-pointer", None) {
            self.source.set_property("show-pointer", visible);
        } else {
            warn!("source element has no show-pointer property");
        }
    }
}

pub(crate) fn make_element(factory: &str, name: &str) -> Result<gst::Element, PipelineError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| PipelineError::ElementCreate(factory.to_string(), e.to_string()))
}

/// Builds the color-conversion tier between the display-source capsfilter and
/// the encoder, per the conversion-tier rules: GPU path probed for NVIDIA
/// (falling back to CPU conversion), a VA post-processor always inserted for
/// VA encoders, plain `videoconvert` for everything else. Returns the
/// elements in link order (already added to `pipeline`); the caller links the
/// chain's ends to its neighbors.
pub(crate) fn build_conversion_tier(
    pipeline: &gst::Pipeline,
    profile: EncoderProfile,
    gpu_index: Option<u32>,
    name_prefix: &str,
) -> Result<Vec<gst::Element>, PipelineError> {
    let target_format = profile.input_format();

    let elements: Vec<gst::Element> = match profile.family() {
        EncoderFamily::Nvidia => {
            let registry = gst::Registry::get();
            let gpu_convert_factory = ["nvvideoconvert", "cudaconvert"]
                .into_iter()
                .find(|f| registry.find_feature(f, gst::ElementFactory::static_type()).is_some());

            if let Some(factory) = gpu_convert_factory {
                let upload = make_element("cudaupload", &format!("{name_prefix}-gpu-upload"))?;
                let convert = make_element(factory, &format!("{name_prefix}-gpu-convert"))?;
                let capsfilter = make_element("capsfilter", &format!("{name_prefix}-gpu-caps"))?;
                for el in [&upload, &convert] {
                    if el.has_property("cuda-device-id", None) {
                        el.set_property("cuda-device-id", gpu_index.unwrap_or(0));
                    }
                }
                let caps = gst::Caps::builder("video/x-raw(memory:CUDAMemory)").field("format", target_format).build();
                capsfilter.set_property("caps", &caps);
                vec![upload, convert, capsfilter]
            } else {
                let convert = make_element("videoconvert", &format!("{name_prefix}-cpu-convert"))?;
                let capsfilter = make_element("capsfilter", &format!("{name_prefix}-cpu-caps"))?;
                let caps = gst::Caps::builder("video/x-raw").field("format", target_format).build();
                capsfilter.set_property("caps", &caps);
                let upload = make_element("cudaupload", &format!("{name_prefix}-gpu-upload"))?;
                if upload.has_property("cuda-device-id", None) {
                    upload.set_property("cuda-device-id", gpu_index.unwrap_or(0));
                }
                vec![convert, capsfilter, upload]
            }
        }
        EncoderFamily::Va => {
            let postproc = make_element("vapostproc", &format!("{name_prefix}-va-postproc"))?;
            let capsfilter = make_element("capsfilter", &format!("{name_prefix}-va-caps"))?;
            let caps = gst::Caps::builder("video/x-raw(memory:VAMemory)").field("format", target_format).build();
            capsfilter.set_property("caps", &caps);
            vec![postproc, capsfilter]
        }
        EncoderFamily::SoftwareH26x | EncoderFamily::Vpx | EncoderFamily::Av1 => {
            let convert = make_element("videoconvert", &format!("{name_prefix}-convert"))?;
            let capsfilter = make_element("capsfilter", &format!("{name_prefix}-caps"))?;
            let caps = gst::Caps::builder("video/x-raw").field("format", target_format).build();
            capsfilter.set_property("caps", &caps);
            vec![convert, capsfilter]
        }
    };

    pipeline
        .add_many(elements.iter())
        .map_err(|e| PipelineError::Link { from: "pipeline".into(), to: format!("add_many (conversion tier) failed: {e}") })?;
    gst::Element::link_many(elements.iter()).map_err(|_| PipelineError::Link {
        from: format!("{name_prefix}-conversion-tier"),
        to: "next".into(),
    })?;

    Ok(elements)
}

/// Checks that every required plugin for `profile` is registered. A missing
/// plugin is a fatal construction failure.
pub fn preflight_plugins(profile: EncoderProfile) -> Result<(), PipelineError> {
    let registry = gst::Registry::get();
    for plugin in BASE_PLUGINS.iter().chain(profile.extra_plugins()) {
        if registry.find_plugin(plugin).is_none() {
            return Err(PipelineError::MissingPlugin((*plugin).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fec_bitrate_passthrough_at_zero_loss() {
        assert_eq!(fec_bitrate(2_000_000, 0.0), 2_000_000);
    }

    #[test]
    fn fec_bitrate_scales_down_with_loss() {
        assert_eq!(fec_bitrate(2_000_000, 10.0), (2_000_000.0 / 1.10).round() as u32);
    }

    #[rstest]
    #[case(EncoderProfile::X264)]
    #[case(EncoderProfile::Vp8)]
    #[case(EncoderProfile::NvH264)]
    #[case(EncoderProfile::Av1)]
    fn fec_bitrate_formula_holds_for_every_profile(#[case] _profile: EncoderProfile) {
        assert_eq!(fec_bitrate(1_000_000, 0.0), 1_000_000);
        assert_eq!(fec_bitrate(1_000_000, 10.0), (1_000_000.0 / 1.10).round() as u32);
    }

    #[test]
    fn gop_size_infinite_is_negative_one() {
        assert_eq!(gop_size(60, KeyframeDistance::Infinite), -1);
    }

    #[test]
    fn gop_size_floors_at_sixty() {
        assert_eq!(gop_size(10, KeyframeDistance::Seconds(1.0)), 60);
    }

    #[test]
    fn gop_size_scales_with_framerate() {
        assert_eq!(gop_size(60, KeyframeDistance::Seconds(2.0)), 120);
    }

    #[test]
    fn vbv_multiplier_differs_by_keyframe_distance() {
        let infinite = vbv_buffer_size(1_000_000, 60, KeyframeDistance::Infinite);
        let finite = vbv_buffer_size(1_000_000, 60, KeyframeDistance::Seconds(2.0));
        assert!(finite > infinite);
    }

    #[test]
    fn payloader_family_groups_match_spec() {
        assert_eq!(EncoderProfile::X264.payloader_family(), PayloaderFamily::H264);
        assert_eq!(EncoderProfile::X265.payloader_family(), PayloaderFamily::H265);
        assert_eq!(EncoderProfile::Vp9.payloader_family(), PayloaderFamily::Vp);
        assert_eq!(EncoderProfile::Av1.payloader_family(), PayloaderFamily::Av1);
    }
}
