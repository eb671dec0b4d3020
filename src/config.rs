use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::pipeline::EncoderProfile;

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub session_defaults: SessionDefaults,
    pub webrtc: WebRtcConfig,
    pub gamepad: GamepadConfig,
    pub features: FeatureToggles,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default)]
    pub transport_mode: TransportMode,
}

/// Which transport a session's video/audio frames take, mirroring the
/// original's server-wide `mode` flag ("webrtc" vs "websockets"): either the
/// full WebRTC orchestrator, or the reduced WebSocket pipeline
/// builder framed directly onto the same signaling socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Webrtc,
    Websockets,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Webrtc
    }
}

/// Target seconds between keyframes, or `Infinite` to disable periodic keyframes
/// (GOP size `-1`).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyframeDistance {
    Infinite,
    Seconds(f64),
}

impl Default for KeyframeDistance {
    fn default() -> Self {
        KeyframeDistance::Seconds(2.0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionDefaults {
    #[serde(default = "default_framerate")]
    pub framerate: i32,

    #[serde(default = "default_video_bitrate")]
    pub video_bitrate_bps: u32,

    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_bps: u32,

    #[serde(default = "default_audio_channels")]
    pub audio_channels: i32,

    #[serde(default)]
    pub video_packetloss_percent: f64,

    #[serde(default)]
    pub audio_packetloss_percent: f64,

    #[serde(default)]
    pub keyframe_distance: KeyframeDistance,

    #[serde(default = "default_encoder")]
    pub encoder: EncoderProfile,

    #[serde(default)]
    pub gpu_index: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    #[serde(default)]
    pub congestion_control: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GamepadConfig {
    #[serde(default = "default_gamepad_socket_dir")]
    pub socket_dir: String,

    #[serde(default = "default_max_pads")]
    pub max_pads: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub clipboard_in: bool,

    #[serde(default = "default_true")]
    pub clipboard_out: bool,

    #[serde(default = "default_true")]
    pub cursor_monitor: bool,

    #[serde(default = "default_true")]
    pub resize: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_clients() -> usize {
    4
}
fn default_framerate() -> i32 {
    30
}
fn default_video_bitrate() -> u32 {
    2_000_000
}
fn default_audio_bitrate() -> u32 {
    96_000
}
fn default_audio_channels() -> i32 {
    2
}
fn default_encoder() -> EncoderProfile {
    EncoderProfile::X264
}
fn default_stun_server() -> String {
    "stun://stun.l.google.com:19302".to_string()
}
fn default_gamepad_socket_dir() -> String {
    "/tmp".to_string()
}
fn default_max_pads() -> usize {
    4
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_addr: default_bind_addr(),
                max_clients: default_max_clients(),
                transport_mode: TransportMode::default(),
            },
            session_defaults: SessionDefaults {
                framerate: default_framerate(),
                video_bitrate_bps: default_video_bitrate(),
                audio_bitrate_bps: default_audio_bitrate(),
                audio_channels: default_audio_channels(),
                video_packetloss_percent: 0.0,
                audio_packetloss_percent: 0.0,
                keyframe_distance: KeyframeDistance::default(),
                encoder: default_encoder(),
                gpu_index: None,
            },
            webrtc: WebRtcConfig {
                stun_server: default_stun_server(),
                congestion_control: false,
            },
            gamepad: GamepadConfig {
                socket_dir: default_gamepad_socket_dir(),
                max_pads: default_max_pads(),
            },
            features: FeatureToggles {
                clipboard_in: true,
                clipboard_out: true,
                cursor_monitor: true,
                resize: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.session_defaults.encoder, EncoderProfile::X264);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string(&config).expect("serialize");
        let parsed: Config = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.server.max_clients, config.server.max_clients);
    }
}
