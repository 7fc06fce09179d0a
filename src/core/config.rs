//! Global configuration for sc-host

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Global configuration flags
pub static VERBOSE: AtomicBool = AtomicBool::new(false);
pub static DEBUG: AtomicBool = AtomicBool::new(false);

/// Check if verbose logging is enabled
#[inline]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Check if debug logging is enabled
#[inline]
pub fn is_debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Which side of the TCP pairing dials the other.
///
/// In reverse mode the host listens and the agent dials back, so the
/// listener must be up before the agent is invoked. In forward mode the
/// host dials 127.0.0.1 through an adb forward, video first, then audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Reverse,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn agent_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Raw,
}

impl AudioCodec {
    pub fn agent_name(self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
            AudioCodec::Raw => "raw",
        }
    }
}

/// Per-session options. Passed in when the session is created; nothing is
/// persisted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub serial: String,
    pub port: u16,
    pub connection_mode: ConnectionMode,
    /// Longest side of the streamed video in pixels, 0 = unlimited.
    pub max_size: u32,
    pub bitrate_bps: u32,
    pub max_fps: u32,
    pub show_touches: bool,
    pub turn_screen_off: bool,
    pub stay_awake: bool,
    pub audio_enabled: bool,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub target_buffering_ms: u32,
    /// Path to the agent artifact pushed to the device.
    pub agent_path: String,
    /// Override for the adb binary; empty = use PATH.
    pub adb_path: String,
    /// Allow the port probe to terminate sibling agent processes that
    /// squat on our port. Off by default.
    pub free_port_on_conflict: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            port: 27183,
            connection_mode: ConnectionMode::Reverse,
            max_size: 0,
            bitrate_bps: 8_000_000,
            max_fps: 60,
            show_touches: false,
            turn_screen_off: false,
            stay_awake: false,
            audio_enabled: true,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Opus,
            target_buffering_ms: 50,
            agent_path: "scrcpy-server.jar".to_string(),
            adb_path: String::new(),
            free_port_on_conflict: false,
        }
    }
}

impl MirrorConfig {
    /// Remote path the agent artifact is pushed to.
    pub const AGENT_REMOTE_PATH: &'static str = "/data/local/tmp/scrcpy-server.jar";

    pub fn adb_binary(&self) -> &str {
        if self.adb_path.is_empty() {
            "adb"
        } else {
            &self.adb_path
        }
    }
}
