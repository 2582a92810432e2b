use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crossbeam_channel::Receiver;
use thiserror::Error;

/// Raw BGR frame captured from a camera source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    /// Capture timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Capture settings applied once when the source is bound.
///
/// Changing any of these requires stopping the source and binding a new one;
/// there is no reconfiguration of a live feed.
#[derive(Clone, Copy, Debug)]
pub struct CaptureOptions {
    pub width: i32,
    pub height: i32,
    /// Target delivery rate requested from the device. Synthetic sources
    /// honor it exactly; real cameras treat it as a hint.
    pub fps: f64,
    /// Request the device's HDR extension mode when available.
    pub hdr: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            hdr: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A running frame source: the delivery channel plus its stop guard.
pub struct FrameFeed {
    pub frames: Receiver<Result<Frame, CaptureError>>,
    pub handle: SourceHandle,
}

/// Owns the capture thread and releases the device when stopped.
///
/// `stop()` is idempotent; dropping the handle stops the source as well, so
/// the device is released on every exit path.
pub struct SourceHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SourceHandle {
    /// Wrap a capture thread. The thread must observe `stop` and exit
    /// promptly once it is set; custom sources use this to participate in
    /// the pipeline's teardown discipline.
    pub fn new(stop: Arc<AtomicBool>, thread: thread::JoinHandle<()>) -> Self {
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Signal the capture thread and block until it has released the device.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.thread.is_none()
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
