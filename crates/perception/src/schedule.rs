//! Detector admission and the inference worker.
//!
//! The pipeline is lossy by design: while an inference is in flight, newly
//! arriving frames are dropped, not queued, trading completeness for bounded
//! latency and memory. [`InflightGate`] is the single point deciding
//! admission; the worker owns the model and releases the gate as soon as the
//! inference call returns, before fusion of its result begins.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use detect_core::{DetectionBatch, ObstacleModel};
use frame_ingest::Frame;

use crate::{
    error::{ErrorEvent, ErrorSink},
    metrics::MetricsAggregator,
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Check-and-set admission: exactly one frame may hold the in-flight token
/// at any instant.
pub struct InflightGate {
    busy: AtomicBool,
    dropped: AtomicU64,
}

impl InflightGate {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attempt to take the in-flight token. Only one caller can win the
    /// idle→busy transition; everyone else is told to drop their frame.
    pub fn try_admit(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Return the token after the inference call has returned.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Count a frame dropped while busy. Returns the running total; this is
    /// a diagnostic, not an error.
    pub fn record_drop(&self) -> u64 {
        metrics::counter!("sentry_capture_dropped_frames_total").increment(1);
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InflightGate {
    fn default() -> Self {
        Self::new()
    }
}

/// One admitted frame on its way to the model.
pub struct FrameTask {
    pub frame: Frame,
    pub frame_number: u64,
}

/// An inference result paired with the frame it came from, headed to fusion.
pub struct DetectionOutput {
    pub frame: Frame,
    pub batch: DetectionBatch,
    pub frame_number: u64,
}

/// Deferred model construction, executed on the worker thread.
///
/// Model loads can be slow; running the factory off the interaction context
/// is the first phase of the two-phase detector lifecycle. The worker
/// reports the outcome over the init channel, and no frame is admitted until
/// that report arrives.
pub type ModelFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn ObstacleModel>> + Send>;

/// How long the worker waits between liveness beats when no work arrives.
const IDLE_BEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Spawn the inference worker.
///
/// The worker constructs the model, reports readiness, then serves one
/// `FrameTask` at a time: run inference, record latency, release the gate,
/// and forward the result to fusion. A failed inference is reported to the
/// error sink and the worker moves on; a single bad frame never stops the
/// stream.
#[allow(clippy::too_many_arguments)]
pub fn spawn_detector_worker(
    factory: ModelFactory,
    work_rx: Receiver<FrameTask>,
    fusion_tx: Sender<DetectionOutput>,
    gate: Arc<InflightGate>,
    metrics: Arc<MetricsAggregator>,
    errors: ErrorSink,
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    init_tx: Sender<Result<(), String>>,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("sentry-detector", move || {
        let mut model = match factory() {
            Ok(model) => {
                if init_tx.send(Ok(())).is_err() {
                    return;
                }
                model
            }
            Err(err) => {
                let _ = init_tx.send(Err(format!("{err:#}")));
                return;
            }
        };
        drop(init_tx);

        loop {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let task = match work_rx.recv_timeout(IDLE_BEAT_INTERVAL) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => {
                    // Idle is healthy; only a stuck inference counts as a stall.
                    health.beat(HealthComponent::Detector);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            let result = model.infer(&task.frame);
            let finished = Instant::now();
            metrics.record_inference_completed(started, finished);
            health.beat(HealthComponent::Detector);
            // Release before fusion: the next camera frame may be admitted
            // while this result is still being fused.
            gate.release();

            match result {
                Ok(batch) => {
                    debug!(
                        frame = task.frame_number,
                        detections = batch.detections.len(),
                        "inference complete"
                    );
                    let output = DetectionOutput {
                        frame: task.frame,
                        batch,
                        frame_number: task.frame_number,
                    };
                    if fusion_tx.send(output).is_err() {
                        error!("fusion channel closed, stopping detector worker");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
                Err(err) => {
                    metrics::counter!("sentry_inference_errors_total").increment(1);
                    errors(ErrorEvent::Inference {
                        frame_number: task.frame_number,
                        error: err,
                    });
                }
            }
        }
    })
    .expect("failed to spawn detector worker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_admission_until_release() {
        let gate = InflightGate::new();
        assert!(gate.try_admit());
        assert!(!gate.try_admit());
        assert!(!gate.try_admit());
        gate.release();
        assert!(gate.try_admit());
    }

    #[test]
    fn concurrent_admission_has_exactly_one_winner() {
        let gate = Arc::new(InflightGate::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(thread::spawn(move || gate.try_admit()));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn drops_accumulate() {
        let gate = InflightGate::new();
        assert_eq!(gate.record_drop(), 1);
        assert_eq!(gate.record_drop(), 2);
        assert_eq!(gate.dropped(), 2);
    }
}
