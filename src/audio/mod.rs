//! Audio module - demultiplexing, decoding, regulation, and output
//!
//! The audio stream is best-effort relative to video: decode failures are
//! logged and the session keeps running.

pub mod decoder;
pub mod parser;
pub mod regulator;
pub mod sink;
pub mod sync;

pub use decoder::{create_audio_decoder, AudioDecoder, AudioFormat, AudioSpecificConfig};
pub use parser::{AudioCodecId, AudioPacket, AudioStreamParser};
pub use regulator::{AudioRegulator, RegulatorConfig, RegulatorStats};
pub use sink::{start_pull_worker, AudioSink, PullWorkerHandle};
pub use sync::{AudioSynchronizer, SyncDecision, VideoSyncInfo};
