//! Audio output
//!
//! The platform output device sits behind the `AudioSink` trait. A 10 ms
//! pull worker drains the regulator into whatever sink is attached; the
//! cpal-backed sink instead pulls the regulator straight from the device
//! callback.

use crate::audio::decoder::AudioFormat;
use crate::audio::regulator::AudioRegulator;
use crate::log_verbose;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receives interleaved Float32 PCM.
pub trait AudioSink: Send {
    fn write(&mut self, pcm: &[f32], format: AudioFormat);
}

/// Handle for the pull worker thread.
pub struct PullWorkerHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PullWorkerHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for PullWorkerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start the timer thread that pulls 10 ms of PCM per tick and hands it
/// to the sink.
pub fn start_pull_worker(
    regulator: Arc<AudioRegulator>,
    format: AudioFormat,
    mut sink: Box<dyn AudioSink>,
) -> PullWorkerHandle {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let tick = Duration::from_millis(10);
    let frames_per_tick = (format.sample_rate as usize) / 100;

    let handle = thread::spawn(move || {
        log_verbose!("AUDIO", "Pull worker started ({} frames/tick)", frames_per_tick);
        while running_clone.load(Ordering::SeqCst) {
            let pcm = regulator.pull(frames_per_tick);
            sink.write(&pcm, format);
            thread::sleep(tick);
        }
        log_verbose!("AUDIO", "Pull worker stopped");
    });

    PullWorkerHandle {
        running,
        handle: Some(handle),
    }
}

#[cfg(feature = "playback")]
pub use cpal_impl::CpalSink;

#[cfg(feature = "playback")]
mod cpal_impl {
    use crate::audio::decoder::AudioFormat;
    use crate::audio::regulator::AudioRegulator;
    use crate::core::error::{MirrorError, Result};
    use crate::log_error;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::sync::Arc;

    /// Plays regulator output through the default cpal device. The device
    /// callback pulls the regulator directly, so no extra worker thread
    /// is involved.
    pub struct CpalSink {
        _stream: cpal::Stream,
    }

    impl CpalSink {
        pub fn start(regulator: Arc<AudioRegulator>, format: AudioFormat) -> Result<Self> {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or_else(|| {
                MirrorError::InitializationFailed("no audio output device found".into())
            })?;

            let channels = format.channels;
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(format.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / usize::from(channels).max(1);
                        let pcm = regulator.pull(frames);
                        let n = pcm.len().min(data.len());
                        data[..n].copy_from_slice(&pcm[..n]);
                        for sample in data[n..].iter_mut() {
                            *sample = 0.0;
                        }
                    },
                    |err| {
                        log_error!("AUDIO", "Stream error: {}", err);
                    },
                    None,
                )
                .map_err(|e| {
                    MirrorError::InitializationFailed(format!("output stream: {}", e))
                })?;

            stream
                .play()
                .map_err(|e| MirrorError::InitializationFailed(format!("playback: {}", e)))?;

            Ok(Self { _stream: stream })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::regulator::RegulatorConfig;
    use std::sync::Mutex;

    struct CollectingSink {
        written: Arc<Mutex<Vec<f32>>>,
    }

    impl AudioSink for CollectingSink {
        fn write(&mut self, pcm: &[f32], _format: AudioFormat) {
            self.written.lock().unwrap().extend_from_slice(pcm);
        }
    }

    #[test]
    fn pull_worker_drains_regulator_into_sink() {
        let regulator = Arc::new(AudioRegulator::new(
            RegulatorConfig::new(48_000, 1).with_target_ms(1),
        ));
        regulator.push(&vec![0.5f32; 4800]);

        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(CollectingSink {
            written: written.clone(),
        });
        let worker = start_pull_worker(
            regulator.clone(),
            AudioFormat {
                sample_rate: 48_000,
                channels: 1,
            },
            sink,
        );

        // A few ticks worth of pulling.
        std::thread::sleep(Duration::from_millis(60));
        worker.stop();
        drop(worker);

        let written = written.lock().unwrap();
        assert!(!written.is_empty());
        assert_eq!(written.len() % 480, 0);
        assert!(written.iter().any(|&s| s == 0.5));
    }
}
