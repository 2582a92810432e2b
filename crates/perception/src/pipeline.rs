//! Pipeline supervisor tying together capture, tracking, inference, fusion,
//! and the presentation sink.
//!
//! The controller owns every cross-stage resource (snapshot slot, in-flight
//! gate, metrics, health state), wires the worker threads, runs the frame
//! admission loop, and tears everything down deterministically on each exit
//! path. A watchdog-armed stall tears the attempt down and starts a fresh
//! one; lifecycle faults propagate to the caller before the running state is
//! reached.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, TrySendError};
use tracing::{debug, error, info, warn};

use frame_ingest::{CaptureError, FrameFeed};
use track_ingest::{TrackingError, TrackingSnapshot};

use crate::{
    config::PerceptionConfig,
    error::{ConfigError, ErrorEvent, ErrorSink, StartError},
    fusion::{spawn_fusion_worker, FusionStage},
    latest::LatestSlot,
    metrics::MetricsAggregator,
    schedule::{spawn_detector_worker, FrameTask, InflightGate, ModelFactory},
    sink::{Notice, PresentationSink},
    telemetry,
    watchdog::{spawn_watchdog, HealthComponent, PipelineHealth, WatchdogState},
};

/// Where tracking sessions publish their snapshots.
pub type SnapshotWriter = Arc<LatestSlot<TrackingSnapshot>>;

/// A bound tracking session; stopping it releases the session resources.
pub trait TrackingSessionHandle: Send {
    fn stop(&mut self);
}

impl TrackingSessionHandle for track_ingest::SessionHandle {
    fn stop(&mut self) {
        track_ingest::SessionHandle::stop(self);
    }
}

/// Externally supplied collaborators. Factories are invoked once per
/// pipeline attempt so a restart reacquires fresh resources.
pub struct Collaborators {
    /// Acquire the camera and start frame delivery.
    pub source: Box<dyn Fn() -> Result<FrameFeed, CaptureError> + Send + Sync>,
    /// Bind the tracking session to the snapshot slot; `None` runs
    /// detection-only.
    #[allow(clippy::type_complexity)]
    pub tracking: Option<
        Box<
            dyn Fn(SnapshotWriter) -> Result<Box<dyn TrackingSessionHandle>, TrackingError>
                + Send
                + Sync,
        >,
    >,
    /// Produce the deferred model constructor for the detector worker.
    pub model: Box<dyn Fn() -> ModelFactory + Send + Sync>,
    pub sink: Arc<dyn PresentationSink>,
    pub errors: ErrorSink,
}

/// Result of a single pipeline attempt.
enum PipelineOutcome {
    Graceful,
    Restart(&'static str),
}

/// Owns the pipeline for its whole life: explicit construction, explicit
/// teardown, no ambient state.
pub struct PerceptionController {
    config: PerceptionConfig,
    collaborators: Collaborators,
    shutdown: Arc<AtomicBool>,
}

impl PerceptionController {
    /// Validate the configuration and build the controller. Nothing is
    /// acquired yet; resource acquisition happens in [`run`](Self::run).
    pub fn new(
        config: PerceptionConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            collaborators,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed by the run loop; setting it ends the pipeline.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run until shutdown, restarting the pipeline when the watchdog arms.
    ///
    /// Start faults (camera acquisition, detector initialization) propagate
    /// immediately; the pipeline never reaches the running state on them.
    pub fn run(&self) -> Result<(), StartError> {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.run_once()? {
                PipelineOutcome::Graceful => return Ok(()),
                PipelineOutcome::Restart(reason) => {
                    attempt = attempt.saturating_add(1);
                    warn!("pipeline restart requested (reason: {reason}), attempt #{attempt}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Execute the pipeline once, returning whether to exit or restart.
    fn run_once(&self) -> Result<PipelineOutcome, StartError> {
        let config = &self.config;
        let sink = self.collaborators.sink.clone();
        let errors: ErrorSink = self.collaborators.errors.clone();
        let _ = telemetry::init_metrics_recorder();

        let metrics = Arc::new(MetricsAggregator::new());
        let snapshot_slot: SnapshotWriter = Arc::new(LatestSlot::new());
        let gate = Arc::new(InflightGate::new());
        let health = Arc::new(PipelineHealth::new());
        let watchdog_state = Arc::new(WatchdogState::new());
        let running = Arc::new(AtomicBool::new(true));

        // Tracking is optional at runtime as well as by configuration: a
        // session that fails to come up degrades to detection-only output
        // rather than blocking the stream.
        let mut tracking_session = match &self.collaborators.tracking {
            Some(bind) => match bind(snapshot_slot.clone()) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    sink.on_notice(Notice::TrackingUnavailable {
                        reason: err.to_string(),
                    });
                    errors(ErrorEvent::Tracking { error: err });
                    None
                }
            },
            None => None,
        };

        let (work_tx, work_rx) = crossbeam_channel::bounded::<FrameTask>(1);
        let (fusion_tx, fusion_rx) = crossbeam_channel::bounded(2);
        let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        let detector_handle = spawn_detector_worker(
            (self.collaborators.model)(),
            work_rx,
            fusion_tx,
            gate.clone(),
            metrics.clone(),
            errors.clone(),
            health.clone(),
            running.clone(),
            init_tx,
        );

        // Two-phase detector lifecycle: the worker performs the (possibly
        // slow) model load off this thread; no frame is admitted until it
        // reports ready.
        loop {
            match init_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(())) => break,
                Ok(Err(message)) => {
                    running.store(false, Ordering::SeqCst);
                    drop(work_tx);
                    let _ = detector_handle.join();
                    stop_tracking(&mut tracking_session);
                    return Err(StartError::Detector(message));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        running.store(false, Ordering::SeqCst);
                        drop(work_tx);
                        let _ = detector_handle.join();
                        stop_tracking(&mut tracking_session);
                        return Ok(PipelineOutcome::Graceful);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    running.store(false, Ordering::SeqCst);
                    drop(work_tx);
                    let _ = detector_handle.join();
                    stop_tracking(&mut tracking_session);
                    return Err(StartError::Detector(
                        "detector worker exited before reporting readiness".into(),
                    ));
                }
            }
        }
        debug!("detector ready, admitting frames");
        // A slow model load must not eat into the stall grace period.
        health.beat(HealthComponent::Capture);
        health.beat(HealthComponent::Detector);
        health.beat(HealthComponent::Fusion);

        let stage = FusionStage::new(
            config.model.confidence_threshold,
            config.model.iou_threshold,
            config.jpeg_quality,
            snapshot_slot.clone(),
            metrics.clone(),
        );
        let fusion_handle =
            spawn_fusion_worker(stage, fusion_rx, sink.clone(), health.clone(), running.clone());

        let watchdog_handle = spawn_watchdog(
            health.clone(),
            running.clone(),
            self.shutdown.clone(),
            watchdog_state.clone(),
        );

        // Camera acquisition is the last start step so a failure here leaves
        // nothing half-running for long.
        let FrameFeed {
            frames,
            handle: mut source_handle,
        } = match (self.collaborators.source)() {
            Ok(feed) => feed,
            Err(err) => {
                running.store(false, Ordering::SeqCst);
                drop(work_tx);
                let _ = detector_handle.join();
                let _ = fusion_handle.join();
                let _ = watchdog_handle.join();
                stop_tracking(&mut tracking_session);
                return Err(StartError::Capture(err));
            }
        };

        info!("perception pipeline running");
        let mut frame_number: u64 = 0;
        let mut restart_reason: Option<&'static str> = None;

        while running.load(Ordering::Relaxed) {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let frame = match frames.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    error!("capture error: {err}");
                    restart_reason = Some("capture error");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("capture channel closed");
                    restart_reason = Some("capture channel closed");
                    break;
                }
            };

            frame_number = frame_number.wrapping_add(1);
            metrics.record_frame_delivered(Instant::now());
            health.beat(HealthComponent::Capture);
            sink.on_metrics_updated(metrics.snapshot());

            if config.verbose && frame_number % 30 == 0 {
                debug!(
                    "capture heartbeat: frame #{frame_number}, {} fps, {} dropped",
                    metrics.current_fps(),
                    gate.dropped()
                );
            }

            // Drop-on-busy admission: while an inference is in flight the
            // frame is discarded, not queued.
            if gate.try_admit() {
                match work_tx.try_send(FrameTask {
                    frame,
                    frame_number,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // The gate guarantees the slot is free; a full queue
                        // here means the worker is gone mid-teardown.
                        gate.release();
                        gate.record_drop();
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        error!("detector worker terminated unexpectedly");
                        restart_reason = Some("detector worker exited");
                        break;
                    }
                }
            } else {
                let total = gate.record_drop();
                if config.verbose {
                    debug!("dropping frame #{frame_number} (inference in flight, dropped total: {total})");
                }
            }
        }

        debug!(
            "stopping perception pipeline ({} frames seen, {} dropped)",
            frame_number,
            gate.dropped()
        );

        // Teardown order: stop admission, disconnect the capture channel so
        // a source blocked mid-send can exit, then drain workers front to
        // back and release the sources. Every path below runs exactly once.
        running.store(false, Ordering::SeqCst);
        drop(frames);
        source_handle.stop();
        drop(work_tx);
        let _ = detector_handle.join();
        let _ = fusion_handle.join();
        let _ = watchdog_handle.join();
        stop_tracking(&mut tracking_session);

        if watchdog_state.is_triggered() {
            let reason = watchdog_state
                .reason()
                .map(|component| component.label())
                .unwrap_or("watchdog");
            return Ok(PipelineOutcome::Restart(reason));
        }
        if let Some(reason) = restart_reason {
            if !self.shutdown.load(Ordering::SeqCst) {
                return Ok(PipelineOutcome::Restart(reason));
            }
        }
        Ok(PipelineOutcome::Graceful)
    }
}

fn stop_tracking(session: &mut Option<Box<dyn TrackingSessionHandle>>) {
    if let Some(handle) = session.as_mut() {
        handle.stop();
    }
    *session = None;
}
