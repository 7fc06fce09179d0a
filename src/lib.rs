//! SC-Host Library
//!
//! A library implementing the host side of the scrcpy streaming protocol:
//! agent launch over adb, video/audio transport, stream demultiplexing,
//! decoding, and audio pacing.

#[macro_use]
pub mod core;
pub mod adb;
pub mod audio;
pub mod network;
pub mod video;

// Re-export commonly used items
pub use crate::core::config::{AudioCodec, ConnectionMode, MirrorConfig, VideoCodec};
pub use crate::core::error::MirrorError;
pub use crate::core::session::{ScrcpySession, SessionState};
