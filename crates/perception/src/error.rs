use std::sync::Arc;

use thiserror::Error;

use detect_core::InferenceError;
use frame_ingest::CaptureError;
use track_ingest::TrackingError;

/// Rejected before the pipeline starts; the pipeline never reaches the
/// running state with an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be within 0.0..=1.0, got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("inference thread count must be at least 1")]
    ZeroThreads,
    #[error("{name} rate must be positive, got {value}")]
    NonPositiveRate { name: &'static str, value: f64 },
    #[error("capture size must be positive, got {width}x{height}")]
    InvalidCaptureSize { width: i32, height: i32 },
    #[error("no model configured for device inference")]
    MissingModel,
}

/// Fatal to pipeline start; surfaced to the caller before any frame is
/// processed.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("camera acquisition failed")]
    Capture(#[from] CaptureError),
    #[error("detector initialization failed: {0}")]
    Detector(String),
}

/// Per-frame faults absorbed inside the pipeline. Reported to the error
/// sink as diagnostics; the stream always continues.
#[derive(Debug)]
pub enum ErrorEvent {
    /// A single frame's inference failed; the frame was skipped.
    Inference {
        frame_number: u64,
        error: InferenceError,
    },
    /// The tracking session degraded mid-run; distances are unavailable
    /// until it recovers.
    Tracking { error: TrackingError },
}

/// Where absorbed faults are reported. Implementations must be cheap and
/// non-blocking; they run on pipeline worker threads.
pub type ErrorSink = Arc<dyn Fn(ErrorEvent) + Send + Sync>;

/// An error sink that only traces.
pub fn log_error_sink() -> ErrorSink {
    Arc::new(|event| match event {
        ErrorEvent::Inference {
            frame_number,
            error,
        } => {
            tracing::warn!("inference fault on frame #{frame_number}: {error}");
        }
        ErrorEvent::Tracking { error } => {
            tracing::warn!("tracking degraded: {error}");
        }
    })
}
