//! SDP post-processing and RTP header-extension bookkeeping.
//!
//! The mangling rules are plain idempotent regex substitutions applied to the
//! local offer's SDP text, mirroring the payload-type extraction idiom in the
//! teacher's `webrtc/codec.rs` (`extract_vp8_payload_type`/`extract_h264_payload_type`)
//! but generalised to the text-patching side of SDP handling.

use once_cell::sync::Lazy;
use regex::Regex;

use super::PayloaderKind;

static APT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"apt=(\d+)(;rtx-time=\d+)?").unwrap());
static PACKETIZATION_MODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"packetization-mode=(\d+)").unwrap());
static SPROP_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(a=fmtp:\d+ [^\n]*sprop-[^\n]*)$").unwrap());

/// Extracts the RTP payload type bound to a codec name (`VP8`, `H264`, ...)
/// from an `a=rtpmap:` line.
pub fn extract_payload_type(sdp: &str, codec_name: &str) -> Option<u32> {
    let needle = format!("{codec_name}/");
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            let pt = parts.next()?.parse::<u32>().ok()?;
            let codec = parts.next()?;
            if codec.starts_with(&needle) {
                return Some(pt);
            }
        }
    }
    None
}

/// Applies the three idempotent SDP mangling rules:
/// `apt=N` gets `;rtx-time=125`; H.264/H.265 payloaders get
/// `profile-level-id`/`level-asymmetry-allowed`/`sps-pps-idr-in-keyframe`
/// next to `packetization-mode=`; OPUS gets `a=ptime:10` after `sprop-*` lines.
pub fn mangle_offer_sdp(sdp: &str, payloader: PayloaderKind) -> String {
    let mut out = APT_RE.replace_all(sdp, "apt=$1;rtx-time=125").to_string();

    if matches!(payloader, PayloaderKind::H264 | PayloaderKind::H265) {
        out = PACKETIZATION_MODE_RE
            .replace_all(&out, |caps: &regex::Captures| {
                let mode = &caps[1];
                format!(
                    "profile-level-id=42e01f;level-asymmetry-allowed=1;sps-pps-idr-in-keyframe=1;packetization-mode={mode}"
                )
            })
            .to_string();
        // idempotency: collapse accidental duplicate insertions from a second pass
        out = out.replace(
            "profile-level-id=42e01f;level-asymmetry-allowed=1;sps-pps-idr-in-keyframe=1;profile-level-id=42e01f;level-asymmetry-allowed=1;sps-pps-idr-in-keyframe=1;",
            "profile-level-id=42e01f;level-asymmetry-allowed=1;sps-pps-idr-in-keyframe=1;",
        );
    }

    if out.contains("opus") || out.contains("OPUS") {
        out = SPROP_LINE_RE
            .replace_all(&out, |caps: &regex::Captures| {
                let line = &caps[1];
                if out_already_has_ptime_after(&out, line) {
                    line.to_string()
                } else {
                    format!("{line}\na=ptime:10")
                }
            })
            .to_string();
    }

    out
}

fn out_already_has_ptime_after(full: &str, line: &str) -> bool {
    if let Some(pos) = full.find(line) {
        let after = &full[pos + line.len()..];
        after.trim_start_matches('\n').starts_with("a=ptime:10")
    } else {
        false
    }
}

/// RTP header-extension URIs this crate registers.
pub const TRANSPORT_WIDE_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

/// Picks the smallest positive extension ID not already in `used`.
pub fn pick_extension_id(used: &[u32]) -> u32 {
    let mut id = 1;
    while used.contains(&id) {
        id += 1;
    }
    id
}

/// Packs the playout-delay extension's 12-bit min/max fields into the
/// three-byte wire layout `[min_hi8, (min_lo4<<4)|max_hi4, max_lo8]`.
pub fn pack_playout_delay(min_delay: u16, max_delay: u16) -> [u8; 3] {
    let min = min_delay & 0x0FFF;
    let max = max_delay & 0x0FFF;
    let min_hi8 = (min >> 4) as u8;
    let min_lo4 = (min & 0x0F) as u8;
    let max_hi4 = (max >> 8) as u8;
    let max_lo8 = (max & 0xFF) as u8;
    [min_hi8, (min_lo4 << 4) | max_hi4, max_lo8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_payload_type_finds_vp8() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\na=rtpmap:96 VP8/90000\n";
        assert_eq!(extract_payload_type(sdp, "VP8"), Some(96));
    }

    #[test]
    fn extract_payload_type_none_when_absent() {
        let sdp = "m=video 9 UDP/TLS/RTP/SAVPF 96\na=rtpmap:96 H264/90000\n";
        assert_eq!(extract_payload_type(sdp, "VP8"), None);
    }

    #[test]
    fn mangle_adds_rtx_time_to_apt() {
        let sdp = "a=fmtp:97 apt=96\n";
        let out = mangle_offer_sdp(sdp, PayloaderKind::H264);
        assert!(out.contains("apt=96;rtx-time=125"));
    }

    #[test]
    fn mangle_is_idempotent() {
        let sdp = "a=fmtp:97 apt=96\na=fmtp:96 packetization-mode=1\n";
        let once = mangle_offer_sdp(sdp, PayloaderKind::H264);
        let twice = mangle_offer_sdp(&once, PayloaderKind::H264);
        assert_eq!(once, twice);
    }

    #[test]
    fn mangle_h264_inserts_profile_fields() {
        let sdp = "a=fmtp:96 packetization-mode=1\n";
        let out = mangle_offer_sdp(sdp, PayloaderKind::H264);
        assert!(out.contains("profile-level-id=42e01f"));
        assert!(out.contains("level-asymmetry-allowed=1"));
        assert!(out.contains("sps-pps-idr-in-keyframe=1"));
    }

    #[test]
    fn extension_id_picks_smallest_free() {
        assert_eq!(pick_extension_id(&[]), 1);
        assert_eq!(pick_extension_id(&[1, 2]), 3);
        assert_eq!(pick_extension_id(&[1, 3]), 2);
    }

    #[test]
    fn playout_delay_packs_three_bytes() {
        let packed = pack_playout_delay(0, 0);
        assert_eq!(packed, [0, 0, 0]);
        let packed_max = pack_playout_delay(0xFFF, 0xFFF);
        assert_eq!(packed_max, [0xFF, 0xFF, 0xFF]);
    }
}
