//! Video module - stream parsing, decoding, and frame dispatch

pub mod decoder;
pub mod parser;
pub mod pipeline;

pub use decoder::VideoDecoder;
#[cfg(feature = "openh264")]
pub use decoder::OpenH264Decoder;
pub use parser::{NalUnit, StreamMetadata, VideoFraming, VideoStreamParser};
pub use pipeline::{ChannelScheduler, FramePipeline, TaskScheduler};
