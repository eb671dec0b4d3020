//! Per-family encoder construction and property-matrix application.
//!
//! Covers the full [`EncoderProfile`] matrix: every family disables
//! B-frames/adaptive-B/lookahead where the property exists, chooses a
//! low-latency preset, and emits byte-stream output for H.264/H.265.

use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::debug;

use super::{fec_bitrate, gop_size, vbv_buffer_size, EncoderFamily, EncoderProfile};
use crate::config::KeyframeDistance;
use crate::error::PipelineError;

/// Bitrate unit: some encoders take bits/second, others take kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitrateUnit {
    Bps,
    Kbps,
}

fn bitrate_unit(profile: EncoderProfile) -> BitrateUnit {
    use EncoderProfile::*;
    match profile {
        Rav1e | OpenH264 | Vp8 | Vp9 => BitrateUnit::Bps,
        _ => BitrateUnit::Kbps,
    }
}

pub fn create_encoder(
    profile: EncoderProfile,
    video_bitrate_bps: u32,
    loss_pct: f64,
    framerate: i32,
    keyframe_distance: KeyframeDistance,
) -> Result<gst::Element, PipelineError> {
    let fec_bps = fec_bitrate(video_bitrate_bps, loss_pct);
    let gop = gop_size(framerate, keyframe_distance);
    let vbv = vbv_buffer_size(fec_bps, framerate, keyframe_distance);

    let element = gst::ElementFactory::make(profile.element_name())
        .build()
        .map_err(|e| PipelineError::ElementCreate(profile.element_name().to_string(), e.to_string()))?;

    configure_common(&element, profile);
    apply_bitrate(&element, profile, fec_bps);
    apply_gop(&element, profile, gop);
    apply_vbv(&element, profile, vbv);

    debug!(element = profile.element_name(), fec_bps, gop, vbv, "encoder configured");

    Ok(element)
}

/// Sets family-appropriate low-latency / zero-B-frame / byte-stream properties
/// that do not change at runtime.
fn configure_common(element: &gst::Element, profile: EncoderProfile) {
    match profile.family() {
        EncoderFamily::SoftwareH26x => {
            if element.has_property("speed-preset", None) {
                element.set_property_from_str("speed-preset", "ultrafast");
            }
            if element.has_property("tune", None) {
                element.set_property_from_str("tune", "zerolatency");
            }
            if element.has_property("bframes", None) {
                element.set_property("bframes", 0u32);
            }
            if element.has_property("b-adapt", None) {
                element.set_property("b-adapt", false);
            }
            if element.has_property("dct8x8", None) {
                element.set_property("dct8x8", false);
            }
            if element.has_property("byte-stream", None) {
                element.set_property("byte-stream", true);
            }
            if element.has_property("rc-lookahead", None) {
                element.set_property("rc-lookahead", 0i32);
            }
            if element.has_property("sliced-threads", None) {
                element.set_property("sliced-threads", false);
            }
            if element.has_property("aud", None) {
                element.set_property("aud", true);
            }
        }
        EncoderFamily::Nvidia => {
            if element.has_property("preset", None) {
                element.set_property_from_str("preset", "low-latency-hq");
            }
            if element.has_property("rc-mode", None) {
                element.set_property_from_str("rc-mode", "cbr");
            }
            if element.has_property("zerolatency", None) {
                element.set_property("zerolatency", true);
            }
            if element.has_property("b-frames", None) {
                element.set_property("b-frames", 0u32);
            }
        }
        EncoderFamily::Va => {
            if element.has_property("rate-control", None) {
                element.set_property_from_str("rate-control", "cbr");
            }
            if element.has_property("b-frames", None) {
                element.set_property("b-frames", 0u32);
            }
            if element.has_property("low-latency", None) {
                element.set_property("low-latency", true);
            }
        }
        EncoderFamily::Vpx => {
            if element.has_property("deadline", None) {
                element.set_property("deadline", 1i64);
            }
            if element.has_property("cpu-used", None) {
                element.set_property("cpu-used", -5i32);
            }
            if element.has_property("lag-in-frames", None) {
                element.set_property("lag-in-frames", 0i32);
            }
            if element.has_property("threads", None) {
                element.set_property("threads", 2i32);
            }
        }
        EncoderFamily::Av1 => {
            if element.has_property("speed-preset", None) {
                element.set_property("speed-preset", 10u32);
            }
            if element.has_property("low-latency-mode", None) {
                element.set_property("low-latency-mode", true);
            }
            if element.has_property("lookahead", None) {
                element.set_property("lookahead", 0u32);
            }
        }
    }
}

/// Applies the FEC-adjusted bitrate (already in the unit the formula computed)
/// to the correct property, scaling for encoders that want a different unit.
pub fn apply_bitrate(element: &gst::Element, profile: EncoderProfile, fec_bps: u32) {
    let value = match bitrate_unit(profile) {
        BitrateUnit::Bps => fec_bps,
        BitrateUnit::Kbps => fec_bps / 1000,
    };
    for prop in ["bitrate", "target-bitrate"] {
        if element.has_property(prop, None) {
            element.set_property(prop, value);
            return;
        }
    }
}

pub fn apply_gop(element: &gst::Element, _profile: EncoderProfile, gop: i32) {
    for prop in ["key-int-max", "keyframe-max-dist", "gop-size"] {
        if element.has_property(prop, None) {
            element.set_property(prop, gop);
            return;
        }
    }
}

pub fn apply_vbv(element: &gst::Element, _profile: EncoderProfile, vbv: u32) {
    for prop in ["vbv-buf-capacity", "cpb-size", "buffer-size"] {
        if element.has_property(prop, None) {
            element.set_property(prop, vbv);
            return;
        }
    }
}
