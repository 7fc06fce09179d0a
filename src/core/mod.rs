//! Core module - session foundation
//!
//! Configuration, logging, the frame handoff primitives, the error
//! taxonomy, and the top-level session state machine.

pub mod config;
pub mod error;
pub mod frame;
#[macro_use]
pub mod logger;
pub mod power;
pub mod ring;
pub mod session;

pub use config::{is_debug, is_verbose, MirrorConfig, DEBUG, VERBOSE};
pub use error::MirrorError;
pub use frame::{FrameBuffer, VideoFrame};
pub use power::{PowerCoordinator, PowerHold};
pub use ring::RingBuffer;
pub use session::{ScrcpySession, SessionState};
