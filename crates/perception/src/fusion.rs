//! Detection/tracking fusion.
//!
//! Pairs each inference result with the tracking snapshot that is current
//! when fusion of that result begins, annotates obstacle distances, renders
//! the overlay, and hands the artifact to the presentation sink. Snapshots
//! arriving while an artifact is being fused do not affect it; there is no
//! retroactive correction.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

use detect_core::{class_label, suppress_overlaps, Detection};
use track_ingest::TrackingSnapshot;

use crate::{
    annotate::render_overlay,
    data::{FusedArtifact, ObstacleReport},
    latest::LatestSlot,
    metrics::MetricsAggregator,
    schedule::DetectionOutput,
    sink::PresentationSink,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

const IDLE_BEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Fusion configuration and collaborators, fixed for the pipeline's life.
pub struct FusionStage {
    confidence_threshold: f32,
    iou_threshold: f32,
    jpeg_quality: u8,
    tracking: Arc<LatestSlot<TrackingSnapshot>>,
    metrics: Arc<MetricsAggregator>,
}

impl FusionStage {
    pub fn new(
        confidence_threshold: f32,
        iou_threshold: f32,
        jpeg_quality: u8,
        tracking: Arc<LatestSlot<TrackingSnapshot>>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            confidence_threshold,
            iou_threshold,
            jpeg_quality,
            tracking,
            metrics,
        }
    }

    /// Fuse one detection result with the snapshot current right now.
    pub fn fuse(&self, output: &DetectionOutput) -> Result<FusedArtifact> {
        // Pin the snapshot before any other work; writes that land after
        // this point belong to the next artifact.
        let snapshot = self.tracking.read();
        self.fuse_with_snapshot(output, snapshot.as_deref())
    }

    /// Fusion body with an explicitly pinned snapshot.
    pub fn fuse_with_snapshot(
        &self,
        output: &DetectionOutput,
        snapshot: Option<&TrackingSnapshot>,
    ) -> Result<FusedArtifact> {
        let frame = &output.frame;

        let candidates: Vec<Detection> = output
            .batch
            .detections
            .iter()
            .filter(|det| det.score >= self.confidence_threshold)
            .cloned()
            .collect();
        let kept = suppress_overlaps(candidates, self.iou_threshold);

        let reports: Vec<ObstacleReport> = kept
            .into_iter()
            .map(|det| {
                let distance_m = snapshot.and_then(|snap| {
                    // Ground-contact reference point: bottom-center of the box.
                    let px = (det.bbox[0] + det.bbox[2]) / 2.0;
                    let py = det.bbox[3];
                    snap.distance_at(px, py, frame.width as f32, frame.height as f32)
                });
                ObstacleReport {
                    class: class_label(det.class_id).to_string(),
                    score: det.score,
                    bbox: det.bbox,
                    distance_m,
                }
            })
            .collect();

        let metrics = self.metrics.snapshot();
        let jpeg = render_overlay(
            frame,
            &reports,
            &metrics,
            output.frame_number,
            self.jpeg_quality,
        )?;

        Ok(FusedArtifact {
            jpeg,
            reports,
            frame_number: output.frame_number,
            timestamp_ms: frame.timestamp_ms,
            metrics,
        })
    }
}

/// Spawn the fusion worker: consume detection outputs, fuse, and hand each
/// artifact to the sink fire-and-forget.
///
/// Empty batches flow through the same path, so the sink always receives a
/// replacement artifact and never keeps showing a prior frame's boxes.
pub fn spawn_fusion_worker(
    stage: FusionStage,
    rx: Receiver<DetectionOutput>,
    sink: Arc<dyn PresentationSink>,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("sentry-fusion", move || {
        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let output = match rx.recv_timeout(IDLE_BEAT_INTERVAL) {
                Ok(output) => output,
                Err(RecvTimeoutError::Timeout) => {
                    health.beat(HealthComponent::Fusion);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // Nothing is delivered once teardown has begun; partial work is
            // discarded rather than published.
            if !running.load(Ordering::Relaxed) {
                break;
            }

            let fuse_start = Instant::now();
            match stage.fuse(&output) {
                Ok(artifact) => {
                    health.beat(HealthComponent::Fusion);
                    metrics::histogram!("sentry_stage_latency_seconds", "stage" => "fusion")
                        .record(fuse_start.elapsed().as_secs_f64());
                    metrics::counter!("sentry_artifacts_total").increment(1);
                    debug!(
                        frame = output.frame_number,
                        obstacles = artifact.reports.len(),
                        "artifact ready"
                    );
                    if running.load(Ordering::Relaxed) {
                        sink.on_artifact_ready(artifact);
                    }
                }
                Err(err) => {
                    error!("fusion stage error: {err:?}");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
    .expect("failed to spawn fusion worker")
}
