//! Frame pipeline
//!
//! Bridges the decoder thread to the UI thread. Frames land in a
//! single-slot buffer and at most one dispatch task is in flight at a
//! time: backpressure comes from coalescing, never from queueing. The
//! consumer sees frames in producer order but may skip intermediate
//! frames whenever the producer outruns the renderer.

use crate::core::frame::{FrameBuffer, VideoFrame};
use crate::log_verbose;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Posts a task onto the thread that owns rendering.
pub trait TaskScheduler: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Scheduler backed by a crossbeam channel the host thread drains.
pub struct ChannelScheduler {
    tx: Sender<Box<dyn FnOnce() + Send>>,
}

impl ChannelScheduler {
    pub fn new() -> (Arc<Self>, Receiver<Box<dyn FnOnce() + Send>>) {
        // Coalescing upstream means a tiny bound suffices.
        let (tx, rx) = crossbeam_channel::bounded(16);
        (Arc::new(Self { tx }), rx)
    }

    /// Run every queued task; returns how many ran.
    pub fn drain(rx: &Receiver<Box<dyn FnOnce() + Send>>) -> usize {
        let mut ran = 0;
        while let Ok(task) = rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }
}

impl TaskScheduler for ChannelScheduler {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The pipeline never has more than one dispatch in flight,
                // so a full queue means the UI thread is gone.
                log_verbose!("PIPE", "Scheduler queue full, dropping dispatch");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

type FrameHandler = Box<dyn FnMut(VideoFrame) + Send>;

struct PipelineShared {
    buffer: FrameBuffer,
    dispatch_pending: AtomicBool,
    running: AtomicBool,
    handler: Mutex<Option<FrameHandler>>,
    size: Mutex<(u32, u32)>,
}

/// Thread-crossing frame dispatcher with most-recent-wins coalescing.
pub struct FramePipeline {
    shared: Arc<PipelineShared>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl FramePipeline {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                buffer: FrameBuffer::new(),
                dispatch_pending: AtomicBool::new(false),
                running: AtomicBool::new(false),
                handler: Mutex::new(None),
                size: Mutex::new((0, 0)),
            }),
            scheduler,
        }
    }

    pub fn set_frame_handler(&self, handler: FrameHandler) {
        *self.shared.handler.lock().unwrap() = Some(handler);
    }

    pub fn start(&self, initial_size: (u32, u32)) {
        *self.shared.size.lock().unwrap() = initial_size;
        self.shared.buffer.reset();
        self.shared.running.store(true, Ordering::SeqCst);
        log_verbose!(
            "PIPE",
            "Pipeline started at {}x{}",
            initial_size.0,
            initial_size.1
        );
    }

    /// Stop dispatching and drop whatever is pending. Frames decoded
    /// before a rotation never reach the consumer after the restart.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.buffer.reset();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn current_size(&self) -> (u32, u32) {
        *self.shared.size.lock().unwrap()
    }

    pub fn set_current_size(&self, size: (u32, u32)) {
        *self.shared.size.lock().unwrap() = size;
    }

    /// Returns true when the frame replaced an unconsumed one (a skip).
    pub fn push_frame(&self, frame: VideoFrame) -> bool {
        if !self.shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let skipped = self.shared.buffer.push(frame);

        // Only one dispatch may be in flight.
        if !self.shared.dispatch_pending.swap(true, Ordering::SeqCst) {
            let shared = self.shared.clone();
            self.scheduler.post(Box::new(move || {
                // Clear the flag first: a push racing with this task gets
                // to schedule the next dispatch for its newer frame.
                shared.dispatch_pending.store(false, Ordering::SeqCst);
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(frame) = shared.buffer.consume() {
                    if let Some(handler) = shared.handler.lock().unwrap().as_mut() {
                        handler(frame);
                    }
                }
            }));
        }
        skipped
    }

    pub fn skipped_count(&self) -> u64 {
        self.shared.buffer.skipped_count()
    }

    pub fn delivered_count(&self) -> u64 {
        self.shared.buffer.consumed_count()
    }
}
