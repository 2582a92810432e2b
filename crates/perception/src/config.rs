//! Configuration parsing for the perception pipeline.
//!
//! CLI arguments are translated once into a [`PerceptionConfig`] before the
//! pipeline starts; downstream stages never re-parse flags and there is no
//! hot-reload: changing any option means a full pipeline restart.

use std::path::PathBuf;

use clap::Args;

use frame_ingest::CaptureOptions;
use track_ingest::TrackingOptions;

use crate::error::ConfigError;

/// Ingress used to source frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Built-in pattern generator; no hardware required.
    Synthetic,
    /// Local camera device (index, path, or URI).
    Device(String),
}

impl SourceKind {
    pub(crate) fn from_uri(uri: &str) -> Self {
        if uri == "synthetic" {
            SourceKind::Synthetic
        } else {
            SourceKind::Device(uri.to_string())
        }
    }
}

/// Inference options resolved once before pipeline start.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    /// TorchScript model path; absent when running the synthetic detector.
    pub model_path: Option<PathBuf>,
    /// Detections below this score never reach the artifact (0–1).
    pub confidence_threshold: f32,
    /// Overlapping same-class boxes above this IOU are de-duplicated (0–1).
    pub iou_threshold: f32,
    /// Inference intra-op thread count.
    pub threads: usize,
    /// Use hardware acceleration when available.
    pub use_accel: bool,
}

/// Canonical configuration shared by every stage in the pipeline.
#[derive(Clone, Debug)]
pub struct PerceptionConfig {
    pub source: SourceKind,
    pub capture: CaptureOptions,
    /// Tracking session features; `None` runs detection-only from the start.
    pub tracking: Option<TrackingOptions>,
    pub model: ModelConfig,
    /// JPEG quality for rendered artifacts (1-100).
    pub jpeg_quality: u8,
    /// Emit verbose logging (frame drops, per-frame detections).
    pub verbose: bool,
    /// Preview server port.
    pub preview_port: u16,
}

impl PerceptionConfig {
    /// Reject invalid option combinations before any resource is acquired.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if !(0.0..=1.0).contains(&model.confidence_threshold) {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "confidence threshold",
                value: model.confidence_threshold,
            });
        }
        if !(0.0..=1.0).contains(&model.iou_threshold) {
            return Err(ConfigError::ThresholdOutOfRange {
                name: "overlap threshold",
                value: model.iou_threshold,
            });
        }
        if model.threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.capture.width <= 0 || self.capture.height <= 0 {
            return Err(ConfigError::InvalidCaptureSize {
                width: self.capture.width,
                height: self.capture.height,
            });
        }
        if self.capture.fps <= 0.0 {
            return Err(ConfigError::NonPositiveRate {
                name: "capture",
                value: self.capture.fps,
            });
        }
        if let Some(tracking) = &self.tracking {
            if tracking.update_hz <= 0.0 {
                return Err(ConfigError::NonPositiveRate {
                    name: "tracking",
                    value: tracking.update_hz,
                });
            }
        }
        if matches!(self.source, SourceKind::Device(_)) && model.model_path.is_none() {
            return Err(ConfigError::MissingModel);
        }
        Ok(())
    }
}

/// CLI arguments accepted by the `obstacle-sentry` binary.
#[derive(Debug, Args)]
pub struct PerceptionCliArgs {
    /// Camera URI, device index, or "synthetic".
    #[arg(long = "source", value_name = "URI", default_value = "synthetic")]
    pub source_uri: String,
    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// Target capture rate.
    #[arg(long = "fps", value_name = "HZ", default_value_t = 30.0)]
    pub fps: f64,
    /// Request the camera's HDR extension mode.
    #[arg(long = "hdr", action = clap::ArgAction::SetTrue)]
    pub hdr: bool,
    /// Confidence threshold (0-1).
    #[arg(long = "confidence", value_name = "SCORE", default_value_t = 0.5)]
    pub confidence: f32,
    /// Overlap (IOU) threshold for duplicate suppression (0-1).
    #[arg(long = "iou", value_name = "RATIO", default_value_t = 0.5)]
    pub iou: f32,
    /// Inference thread count.
    #[arg(long = "threads", value_name = "N", default_value_t = 2)]
    pub threads: usize,
    /// Enable hardware-accelerated inference.
    #[arg(long = "accel", action = clap::ArgAction::SetTrue)]
    pub accel: bool,
    /// Disable the tracking session (detection-only, no distances).
    #[arg(long = "no-tracking", action = clap::ArgAction::SetTrue)]
    pub no_tracking: bool,
    /// Tracking update rate for the synthetic session.
    #[arg(long = "tracking-hz", value_name = "HZ", default_value_t = 30.0)]
    pub tracking_hz: f64,
    /// JPEG quality for rendered artifacts (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Emit verbose logging (frame drops, detection details).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Preview server port.
    #[arg(long = "preview-port", value_name = "PORT", default_value_t = 8080)]
    pub preview_port: u16,
}

impl TryFrom<PerceptionCliArgs> for PerceptionConfig {
    type Error = ConfigError;

    fn try_from(args: PerceptionCliArgs) -> Result<Self, ConfigError> {
        let config = PerceptionConfig {
            source: SourceKind::from_uri(&args.source_uri),
            capture: CaptureOptions {
                width: args.width,
                height: args.height,
                fps: args.fps,
                hdr: args.hdr,
            },
            tracking: (!args.no_tracking).then(|| TrackingOptions {
                update_hz: args.tracking_hz,
                ..TrackingOptions::default()
            }),
            model: ModelConfig {
                model_path: args.model_path,
                confidence_threshold: args.confidence,
                iou_threshold: args.iou,
                threads: args.threads,
                use_accel: args.accel,
            },
            jpeg_quality: args.jpeg_quality.clamp(1, 100),
            verbose: args.verbose,
            preview_port: args.preview_port,
        };
        config.validate()?;
        Ok(config)
    }
}
