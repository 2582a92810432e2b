//! Camera frame acquisition for the obstacle-sentry pipeline.
//!
//! Sources deliver `Result<Frame, CaptureError>` over a small bounded channel
//! and are owned by a [`SourceHandle`] that releases the device when stopped
//! or dropped. Capture settings ([`CaptureOptions`]) are fixed when the
//! source is bound; a live feed is never reconfigured.

#[cfg(feature = "opencv-capture")]
mod camera;
mod synthetic;
mod types;

#[cfg(feature = "opencv-capture")]
pub use camera::spawn_camera_reader;
pub use synthetic::spawn_synthetic_source;
pub use types::{CaptureError, CaptureOptions, Frame, FrameFeed, FrameFormat, SourceHandle};
