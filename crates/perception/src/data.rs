use std::sync::{Arc, Mutex};

use serde::Serialize;

/// One obstacle as presented to the user: class, confidence, box, and the
/// fused distance when the tracking session could supply one.
#[derive(Clone, Debug, Serialize)]
pub struct ObstacleReport {
    pub class: String,
    pub score: f32,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],
    /// Meters from the device; absent when no snapshot was available or the
    /// depth lookup missed the tracked region. Never fabricated.
    pub distance_m: Option<f32>,
}

/// Performance readout embedded into each artifact.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub fps: u32,
    pub inference_latency_ms: u64,
}

/// Final renderable output of one frame's traversal: the annotated image,
/// the per-obstacle reports, and the metrics valid at production time.
///
/// Ownership transfers to the presentation sink; last write wins, there is
/// no artifact queue.
#[derive(Clone)]
pub struct FusedArtifact {
    pub jpeg: Vec<u8>,
    pub reports: Vec<ObstacleReport>,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub metrics: MetricsSnapshot,
}

/// Overwrite-on-write slot the presentation layer reads from.
pub type SharedArtifact = Arc<Mutex<Option<FusedArtifact>>>;

/// JSON body served by the preview endpoints.
#[derive(Serialize)]
pub struct ObstaclesResponse<'a> {
    pub timestamp_ms: i64,
    pub frame_number: u64,
    pub fps: u32,
    pub inference_latency_ms: u64,
    pub obstacles: &'a [ObstacleReport],
}
