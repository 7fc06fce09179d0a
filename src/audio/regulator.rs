//! Audio jitter regulation
//!
//! Sits between the decoder (push) and the audio sink (pull). Absorbs
//! arrival jitter by buffering toward a target level, drops the oldest
//! samples when the buffer would exceed its maximum, and corrects slow
//! drift by skipping a bounded chunk once the accumulated deviation
//! crosses the resync threshold. All bookkeeping is in sample frames.

use crate::core::ring::RingBuffer;
use crate::log_debug;
use std::sync::Mutex;

pub const DEFAULT_TARGET_MS: u32 = 50;
pub const DEFAULT_MAX_MS: u32 = 200;
pub const DEFAULT_RESYNC_MS: u32 = 100;
/// Smoothing factor for the average-buffering estimate.
const BUFFERING_EMA_ALPHA: f64 = 0.05;
/// Drift is re-evaluated every 20 ms worth of consumed frames at 48 kHz.
const DRIFT_CHECK_INTERVAL_FRAMES: u64 = 960;

#[derive(Debug, Clone, Copy)]
pub struct RegulatorConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub target_ms: u32,
    pub max_ms: u32,
    pub resync_ms: u32,
}

impl RegulatorConfig {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            target_ms: DEFAULT_TARGET_MS,
            max_ms: DEFAULT_MAX_MS,
            resync_ms: DEFAULT_RESYNC_MS,
        }
    }

    pub fn with_target_ms(mut self, target_ms: u32) -> Self {
        self.target_ms = target_ms;
        self
    }

    fn frames(&self, ms: u32) -> usize {
        (self.sample_rate as usize * ms as usize) / 1000
    }
}

/// Counters for the conservation property:
/// pushed = (consumed - underflow) + overflow + buffered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegulatorStats {
    /// Frames accepted from the decoder (including later-discarded ones).
    pub pushed_frames: u64,
    /// Frames handed to the sink, silence padding included.
    pub consumed_frames: u64,
    /// Silence frames inserted on underflow.
    pub underflow_frames: u64,
    /// Frames discarded on overflow or drift resync.
    pub overflow_frames: u64,
    /// Frames currently buffered.
    pub buffered_frames: u64,
}

struct RegulatorInner {
    ring: RingBuffer<f32>,
    target_frames: usize,
    max_frames: usize,
    resync_frames: usize,
    channels: usize,
    has_received: bool,
    has_played: bool,
    avg_buffering: f64,
    compensation_pending: f64,
    frames_since_check: u64,
    pushed: u64,
    consumed: u64,
    underflow: u64,
    overflow: u64,
}

pub struct AudioRegulator {
    inner: Mutex<RegulatorInner>,
}

impl AudioRegulator {
    pub fn new(config: RegulatorConfig) -> Self {
        let channels = usize::from(config.channels).max(1);
        let max_frames = config.frames(config.max_ms).max(1);
        Self {
            inner: Mutex::new(RegulatorInner {
                // One extra slot: the ring keeps one reserved.
                ring: RingBuffer::new(max_frames * channels + 1),
                target_frames: config.frames(config.target_ms),
                max_frames,
                resync_frames: config.frames(config.resync_ms).max(1),
                channels,
                has_received: false,
                has_played: false,
                avg_buffering: 0.0,
                compensation_pending: 0.0,
                frames_since_check: 0,
                pushed: 0,
                consumed: 0,
                underflow: 0,
                overflow: 0,
            }),
        }
    }

    /// Append decoded PCM (interleaved f32). When the buffer would exceed
    /// its maximum, the oldest frames are discarded first.
    pub fn push(&self, pcm: &[f32]) {
        let mut inner = self.inner.lock().unwrap();
        let channels = inner.channels;
        let frames = pcm.len() / channels;
        if frames == 0 {
            return;
        }
        inner.has_received = true;
        inner.pushed += frames as u64;

        let buffered = inner.ring.count() / channels;
        let overflow = (buffered + frames).saturating_sub(inner.max_frames);
        let mut pcm = pcm;
        if overflow > 0 {
            let from_ring = overflow.min(buffered);
            inner.ring.skip(from_ring * channels);
            let from_input = overflow - from_ring;
            pcm = &pcm[from_input * channels..];
            inner.overflow += overflow as u64;
            log_debug!(
                "REG",
                "Overflow: dropped {} frames ({} buffered)",
                overflow,
                buffered
            );
        }
        inner.ring.write_bulk(pcm);

        let buffered = (inner.ring.count() / channels) as f64;
        inner.avg_buffering += BUFFERING_EMA_ALPHA * (buffered - inner.avg_buffering);
    }

    /// Pull exactly `frames` frames (`frames * channels` f32 values).
    /// Silence until the buffer first reaches the target level; after
    /// that, shortfalls are zero-padded and accounted as underflow.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut inner = self.inner.lock().unwrap();
        let channels = inner.channels;
        let wanted = frames * channels;

        let buffered = inner.ring.count() / channels;
        if !inner.has_played {
            if buffered < inner.target_frames {
                return vec![0.0; wanted];
            }
            inner.has_played = true;
            log_debug!("REG", "Primed with {} frames, starting playback", buffered);
        }

        let available = inner.ring.count().min(wanted);
        let out = inner.ring.read_bulk(wanted, 0.0);
        debug_assert_eq!(out.len(), wanted);
        let real_frames = available / channels;
        let short = frames - real_frames;
        inner.consumed += frames as u64;
        if short > 0 {
            inner.underflow += short as u64;
            // read_bulk already padded with zeros.
        }

        self.compensate(&mut inner, frames as u64);
        out
    }

    /// Accumulate the deviation from the target every 20 ms of consumed
    /// audio; once the debt exceeds the resync threshold, skip a bounded
    /// chunk (too full) or clear the debt and let silence padding absorb
    /// it (too empty). Bounded corrections, no pitch distortion.
    fn compensate(&self, inner: &mut RegulatorInner, consumed_frames: u64) {
        inner.frames_since_check += consumed_frames;
        if inner.frames_since_check < DRIFT_CHECK_INTERVAL_FRAMES {
            return;
        }
        inner.frames_since_check = 0;

        let deviation = inner.avg_buffering - inner.target_frames as f64;
        inner.compensation_pending += deviation;

        if inner.compensation_pending > inner.resync_frames as f64 {
            let skip_frames = inner.resync_frames / 2;
            let skipped = inner.ring.skip(skip_frames * inner.channels) / inner.channels;
            inner.overflow += skipped as u64;
            inner.compensation_pending = 0.0;
            log_debug!("REG", "Drift resync: skipped {} frames", skipped);
        } else if inner.compensation_pending < -(inner.resync_frames as f64) {
            inner.compensation_pending = 0.0;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.clear();
        inner.has_received = false;
        inner.has_played = false;
        inner.avg_buffering = 0.0;
        inner.compensation_pending = 0.0;
        inner.frames_since_check = 0;
        inner.pushed = 0;
        inner.consumed = 0;
        inner.underflow = 0;
        inner.overflow = 0;
    }

    pub fn stats(&self) -> RegulatorStats {
        let inner = self.inner.lock().unwrap();
        RegulatorStats {
            pushed_frames: inner.pushed,
            consumed_frames: inner.consumed,
            underflow_frames: inner.underflow,
            overflow_frames: inner.overflow,
            buffered_frames: (inner.ring.count() / inner.channels) as u64,
        }
    }

    pub fn buffered_frames(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ring.count() / inner.channels
    }

    pub fn has_received(&self) -> bool {
        self.inner.lock().unwrap().has_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_regulator() -> AudioRegulator {
        // 48 kHz mono: target 2400, max 9600, resync 4800 frames.
        AudioRegulator::new(RegulatorConfig::new(48_000, 1))
    }

    fn frames(n: usize, value: f32) -> Vec<f32> {
        vec![value; n]
    }

    #[test]
    fn silence_until_primed_to_target() {
        let reg = mono_regulator();
        reg.push(&frames(1000, 0.5));
        let out = reg.pull(480);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(reg.buffered_frames(), 1000);

        reg.push(&frames(1500, 0.5));
        let out = reg.pull(480);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn pull_returns_exact_length_with_zero_padding() {
        let reg = mono_regulator();
        reg.push(&frames(2500, 0.25));
        let out = reg.pull(2400);
        assert_eq!(out.len(), 2400);
        // 100 real frames left; the rest of this pull is silence.
        let out = reg.pull(480);
        assert_eq!(out.len(), 480);
        assert!(out[..100].iter().all(|&s| s == 0.25));
        assert!(out[100..].iter().all(|&s| s == 0.0));
        assert_eq!(reg.stats().underflow_frames, 380);
    }

    #[test]
    fn overflow_drops_oldest_and_accounts() {
        // max = 200 ms @ 48 kHz = 9600 frames.
        let reg = mono_regulator();
        reg.push(&frames(12_000, 1.0));
        let stats = reg.stats();
        assert_eq!(stats.overflow_frames, 2400);
        assert_eq!(stats.buffered_frames, 9600);
    }

    #[test]
    fn overflow_prefers_dropping_buffered_frames() {
        let reg = mono_regulator();
        reg.push(&frames(9000, 1.0));
        reg.push(&frames(1000, 2.0));
        let stats = reg.stats();
        assert_eq!(stats.overflow_frames, 400);
        assert_eq!(stats.buffered_frames, 9600);
        // Prime and drain: the tail must be the newer samples.
        let out = reg.pull(9600);
        assert_eq!(out[9599], 2.0);
    }

    #[test]
    fn conservation_holds_across_mixed_traffic() {
        let reg = mono_regulator();
        for i in 0..50 {
            reg.push(&frames(700 + (i % 7) * 100, 0.1));
            let _ = reg.pull(480);
            let _ = reg.pull(480);
        }
        let stats = reg.stats();
        assert_eq!(
            stats.pushed_frames,
            stats.consumed_frames - stats.underflow_frames
                + stats.overflow_frames
                + stats.buffered_frames
        );
    }

    #[test]
    fn stereo_frame_accounting() {
        let reg = AudioRegulator::new(RegulatorConfig::new(48_000, 2).with_target_ms(10));
        // 480 stereo frames = 960 samples; target is 480 frames.
        reg.push(&vec![0.5f32; 960]);
        let out = reg.pull(240);
        assert_eq!(out.len(), 480);
        assert!(out.iter().all(|&s| s == 0.5));
        assert_eq!(reg.stats().consumed_frames, 240);
    }

    #[test]
    fn sustained_surplus_triggers_a_bounded_skip() {
        let reg = mono_regulator();
        // Keep the buffer pinned far above target: push more than pulled.
        for _ in 0..400 {
            reg.push(&frames(960, 0.7));
            let _ = reg.pull(480);
        }
        let stats = reg.stats();
        // Both the max-level drops and the drift resync land in overflow;
        // either way the books must balance.
        assert!(stats.overflow_frames > 0);
        assert!(stats.buffered_frames <= 9600);
        assert_eq!(
            stats.pushed_frames,
            stats.consumed_frames - stats.underflow_frames
                + stats.overflow_frames
                + stats.buffered_frames
        );
    }

    #[test]
    fn reset_restores_initial_state() {
        let reg = mono_regulator();
        reg.push(&frames(3000, 0.5));
        let _ = reg.pull(480);
        reg.reset();
        assert_eq!(reg.stats(), RegulatorStats::default());
        assert!(!reg.has_received());
        // Priming is required again after reset.
        reg.push(&frames(100, 0.5));
        assert!(reg.pull(50).iter().all(|&s| s == 0.0));
    }
}
