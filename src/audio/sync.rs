//! Audio clock tracking
//!
//! Observes the PTS of every decoded audio packet against a monotonic
//! clock, estimates how late or early the stream is running, and advises
//! the playback side: drop packets that arrive hopelessly late, nudge the
//! playback rate a couple of percent to chase slow drift, and tell the
//! video path whether to skip or wait. Wall clocks can jump backwards;
//! `Instant` cannot, which is why it is used here.

use crate::log_verbose;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EMA factor for delay and drift estimates.
const EMA_ALPHA: f64 = 0.1;
/// PTS jumps beyond max(10%, this many µs) of the expected delta reset
/// the baseline.
const DISCONTINUITY_FLOOR_US: f64 = 100_000.0;
/// Beyond this the packet is dropped (late) or flagged early.
const HARD_DRIFT_MS: f64 = 200.0;
/// Rate is nudged once drift passes this.
const RATE_ADJUST_THRESHOLD_MS: f64 = 30.0;
const MIN_RATE: f64 = 0.95;
const MAX_RATE: f64 = 1.05;
const DRIFT_HISTORY_LEN: usize = 50;

/// Verdict for one audio packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDecision {
    /// False when the packet should be dropped (arrived too late).
    pub should_play: bool,
    pub is_discontinuity: bool,
    /// How late (positive) or early (negative) the packet arrived, ms.
    pub current_delay_ms: f64,
    /// Smoothed drift estimate, ms.
    pub drift_ms: f64,
    /// Advisory playback rate in [0.95, 1.05].
    pub suggested_rate: f64,
}

/// Relation of a video PTS to the audio clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoSyncInfo {
    /// last_audio_pts - video_pts, in ms. Positive: audio is ahead.
    pub offset_ms: f64,
    pub should_skip_video: bool,
    pub should_wait_for_audio: bool,
}

pub struct AudioSynchronizer {
    sample_rate: u32,
    first_pts: Option<u64>,
    first_instant: Option<Instant>,
    last_pts: Option<u64>,
    last_sample_count: u32,
    est_delay_ms: f64,
    drift_ms: f64,
    drift_history: VecDeque<f64>,
    suggested_rate: f64,
    discontinuities: u64,
}

impl AudioSynchronizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            first_pts: None,
            first_instant: None,
            last_pts: None,
            last_sample_count: 0,
            est_delay_ms: 0.0,
            drift_ms: 0.0,
            drift_history: VecDeque::with_capacity(DRIFT_HISTORY_LEN),
            suggested_rate: 1.0,
            discontinuities: 0,
        }
    }

    /// Track one packet: `pts_us` is its presentation time, `sample_count`
    /// the frames it carries.
    pub fn process_audio_pts(&mut self, pts_us: u64, sample_count: u32) -> SyncDecision {
        self.process_audio_pts_at(pts_us, sample_count, Instant::now())
    }

    /// Clock-injected variant; `process_audio_pts` passes `Instant::now()`.
    pub fn process_audio_pts_at(
        &mut self,
        pts_us: u64,
        sample_count: u32,
        now: Instant,
    ) -> SyncDecision {
        let mut is_discontinuity = false;

        if let Some(last_pts) = self.last_pts.filter(|_| self.first_pts.is_some()) {
            let expected_delta =
                self.last_sample_count as f64 / self.sample_rate as f64 * 1_000_000.0;
            let regressed = pts_us < last_pts;
            let actual_delta = pts_us.saturating_sub(last_pts) as f64;
            let tolerance = (expected_delta * 0.1).max(DISCONTINUITY_FLOOR_US);
            if regressed || (actual_delta - expected_delta).abs() > tolerance {
                log_verbose!(
                    "SYNC",
                    "PTS discontinuity: last={}us now={}us expected_delta={:.0}us",
                    last_pts,
                    pts_us,
                    expected_delta
                );
                self.reset_baseline();
                is_discontinuity = true;
            }
        }

        if self.first_pts.is_none() {
            self.first_pts = Some(pts_us);
            self.first_instant = Some(now);
        }
        self.last_pts = Some(pts_us);
        self.last_sample_count = sample_count;

        // Where this packet should have landed on the local clock.
        let first_pts = self.first_pts.unwrap();
        let first_instant = self.first_instant.unwrap();
        let expected = first_instant + Duration::from_micros(pts_us.saturating_sub(first_pts));
        let delay_ms = if now >= expected {
            now.duration_since(expected).as_secs_f64() * 1000.0
        } else {
            -(expected.duration_since(now).as_secs_f64() * 1000.0)
        };

        if is_discontinuity {
            self.est_delay_ms = delay_ms;
            self.drift_ms = 0.0;
        } else {
            self.est_delay_ms += EMA_ALPHA * (delay_ms - self.est_delay_ms);
            self.drift_ms += EMA_ALPHA * (delay_ms - self.drift_ms);
        }
        if self.drift_history.len() == DRIFT_HISTORY_LEN {
            self.drift_history.pop_front();
        }
        self.drift_history.push_back(self.drift_ms);

        let mut should_play = true;
        if self.drift_ms > HARD_DRIFT_MS {
            // Hopelessly late; dropping is the only way to catch up.
            should_play = false;
        }

        self.suggested_rate = if self.drift_ms > RATE_ADJUST_THRESHOLD_MS {
            1.02_f64
        } else if self.drift_ms < -RATE_ADJUST_THRESHOLD_MS {
            0.98_f64
        } else {
            1.0_f64
        }
        .clamp(MIN_RATE, MAX_RATE);

        SyncDecision {
            should_play,
            is_discontinuity,
            current_delay_ms: delay_ms,
            drift_ms: self.drift_ms,
            suggested_rate: self.suggested_rate,
        }
    }

    /// Relate a video PTS to the most recent audio PTS.
    pub fn get_video_sync_info(&self, video_pts_us: u64) -> VideoSyncInfo {
        let offset_ms = match self.last_pts {
            Some(audio_pts) => (audio_pts as f64 - video_pts_us as f64) / 1000.0,
            None => 0.0,
        };
        VideoSyncInfo {
            offset_ms,
            should_skip_video: offset_ms < -HARD_DRIFT_MS,
            should_wait_for_audio: offset_ms > HARD_DRIFT_MS,
        }
    }

    pub fn suggested_rate(&self) -> f64 {
        self.suggested_rate
    }

    pub fn drift_ms(&self) -> f64 {
        self.drift_ms
    }

    pub fn discontinuity_count(&self) -> u64 {
        self.discontinuities
    }

    pub fn reset(&mut self) {
        self.reset_baseline();
        self.last_pts = None;
        self.last_sample_count = 0;
        self.drift_history.clear();
        self.suggested_rate = 1.0;
        self.discontinuities = 0;
    }

    /// Once seeded, the baseline only moves on a detected discontinuity.
    fn reset_baseline(&mut self) {
        self.first_pts = None;
        self.first_instant = None;
        self.est_delay_ms = 0.0;
        self.drift_ms = 0.0;
        self.discontinuities += 1;
    }
}
