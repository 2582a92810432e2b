use nalgebra::{Isometry3, Point3, Vector3};
use thiserror::Error;

/// Session features resolved once when the tracking session is configured.
#[derive(Clone, Copy, Debug)]
pub struct TrackingOptions {
    pub plane_detection: PlaneDetectionMode,
    pub light_estimation: LightEstimationMode,
    pub depth_mode: DepthMode,
    /// Snapshot cadence for the synthetic session.
    pub update_hz: f64,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            plane_detection: PlaneDetectionMode::HorizontalAndVertical,
            light_estimation: LightEstimationMode::EnvironmentalHdr,
            depth_mode: DepthMode::Automatic,
            update_hz: 30.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneDetectionMode {
    Disabled,
    Horizontal,
    HorizontalAndVertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LightEstimationMode {
    Disabled,
    AmbientIntensity,
    EnvironmentalHdr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepthMode {
    Disabled,
    Automatic,
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking session failed to initialize: {0}")]
    Init(String),
    #[error("depth mode is disabled for this session")]
    DepthUnavailable,
}

/// Pinhole camera intrinsics in pixels, matching the capture resolution.
#[derive(Clone, Copy, Debug)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Intrinsics {
    /// A plausible default for a given capture size (~60° horizontal FOV).
    pub fn for_resolution(width: i32, height: i32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            fx: w * 0.87,
            fy: w * 0.87,
            cx: w / 2.0,
            cy: h / 2.0,
        }
    }
}

/// Dense depth estimate over the camera image, in meters along the view ray.
///
/// The grid is typically coarser than the camera frame; lookups take
/// normalized image coordinates. Non-finite and non-positive cells mean the
/// scene was not tracked at that ray.
#[derive(Clone, Debug)]
pub struct DepthMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthMap {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height, "depth grid size mismatch");
        Self {
            width,
            height,
            data,
        }
    }

    /// Nearest-cell depth at normalized coordinates `(u, v)` in `[0, 1)`.
    ///
    /// Returns `None` outside the grid or where the cell holds no estimate.
    pub fn sample(&self, u: f32, v: f32) -> Option<f32> {
        if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
            return None;
        }
        let x = ((u * self.width as f32) as usize).min(self.width - 1);
        let y = ((v * self.height as f32) as usize).min(self.height - 1);
        let d = self.data[y * self.width + x];
        (d.is_finite() && d > 0.0).then_some(d)
    }
}

/// The tracking session's pose/depth estimate at one update.
///
/// Immutable once produced; shared with any number of concurrent readers.
#[derive(Clone, Debug)]
pub struct TrackingSnapshot {
    /// Timestamp at which this estimate was computed, ms since the epoch.
    pub timestamp_ms: i64,
    /// Camera-to-world transform.
    pub pose: Isometry3<f32>,
    pub intrinsics: Intrinsics,
    pub depth: DepthMap,
}

impl TrackingSnapshot {
    /// Metric distance from the device to the scene point behind pixel
    /// `(px, py)` of a `frame_w`×`frame_h` image.
    ///
    /// Samples the depth map along the pixel's ray and back-projects through
    /// the intrinsics, so off-center rays report euclidean distance rather
    /// than raw ray depth. `None` when the ray leaves the tracked region.
    pub fn distance_at(&self, px: f32, py: f32, frame_w: f32, frame_h: f32) -> Option<f32> {
        if frame_w <= 0.0 || frame_h <= 0.0 {
            return None;
        }
        let depth = self.depth.sample(px / frame_w, py / frame_h)?;

        let x = (px - self.intrinsics.cx) / self.intrinsics.fx;
        let y = (py - self.intrinsics.cy) / self.intrinsics.fy;
        let camera_point = Point3::from(Vector3::new(x, y, 1.0) * depth);
        Some((camera_point - Point3::origin()).norm())
    }

    /// The tracked point behind pixel `(px, py)` in world coordinates.
    pub fn world_point_at(
        &self,
        px: f32,
        py: f32,
        frame_w: f32,
        frame_h: f32,
    ) -> Option<Point3<f32>> {
        let depth = self.depth.sample(px / frame_w, py / frame_h)?;
        let x = (px - self.intrinsics.cx) / self.intrinsics.fx;
        let y = (py - self.intrinsics.cy) / self.intrinsics.fy;
        let camera_point = Point3::from(Vector3::new(x, y, 1.0) * depth);
        Some(self.pose.transform_point(&camera_point))
    }
}
