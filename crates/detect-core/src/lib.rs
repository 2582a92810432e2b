//! Obstacle detection model boundary.
//!
//! The pipeline schedules inference against the [`ObstacleModel`] trait; the
//! TorchScript adapter behind the `with-tch` feature is one implementation,
//! test fakes are another. Detection geometry helpers (IOU, greedy NMS) live
//! here so both the fusion stage and model adapters share one definition.

use thiserror::Error;

use frame_ingest::Frame;

#[cfg(feature = "with-tch")]
mod torch;

#[cfg(feature = "with-tch")]
pub use torch::{TorchModel, TorchModelOptions};

/// One detected object in frame pixel coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` corners, x right, y down.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.bbox[0].max(other.bbox[0]);
        let iy1 = self.bbox[1].max(other.bbox[1]);
        let ix2 = self.bbox[2].min(other.bbox[2]);
        let iy2 = self.bbox[3].min(other.bbox[3]);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// All detections produced by one inference run. May be empty.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("malformed input frame: {0}")]
    MalformedInput(String),
    #[error("model execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

/// Inference collaborator: consumes one frame at a time, synchronously.
///
/// Implementations are driven from a single worker thread; the scheduling
/// contract around them guarantees calls never overlap.
pub trait ObstacleModel: Send {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionBatch, InferenceError>;
}

/// Obstacle classes recognized by the bundled models.
pub const CLASS_LABELS: &[&str] = &[
    "person", "bicycle", "car", "pole", "bench", "tree", "wall", "stairs", "door", "curb",
];

/// Human-readable label for a class id.
pub fn class_label(class_id: i64) -> &'static str {
    usize::try_from(class_id)
        .ok()
        .and_then(|idx| CLASS_LABELS.get(idx))
        .copied()
        .unwrap_or("obstacle")
}

/// Greedy per-class non-maximum suppression.
///
/// Sorts by confidence descending and suppresses boxes of the same class
/// whose IOU with an already-kept box exceeds `iou_threshold`. Boxes of
/// different classes never suppress each other.
pub fn suppress_overlaps(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j]
                && detections[i].class_id == detections[j].class_id
                && detections[i].iou(&detections[j]) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        kept.push(detections[i].clone());
    }

    kept
}
