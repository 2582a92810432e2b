//! Synthetic tracked-scene session.
//!
//! Stands in for a device AR session in demos and tests: produces pose/depth
//! snapshots at a fixed cadence and invokes the update callback on the
//! session thread, the same contract a hardware-backed session would honor.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use tracing::debug;

use crate::types::{DepthMap, DepthMode, Intrinsics, TrackingError, TrackingOptions,
    TrackingSnapshot};

const DEPTH_GRID_W: usize = 32;
const DEPTH_GRID_H: usize = 24;

/// Owns the session thread; the session stops when the handle is stopped or
/// dropped.
pub struct SessionHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// End the session and block until its thread has exited. Idempotent.
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

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a synthetic session that calls `on_update` with a fresh snapshot at
/// `opts.update_hz`, mimicking a per-tracked-frame session callback.
///
/// Fails at configure time when the requested feature set cannot be
/// satisfied, before the session thread exists.
pub fn spawn_synthetic_session<F>(
    opts: TrackingOptions,
    frame_size: (i32, i32),
    on_update: F,
) -> Result<SessionHandle, TrackingError>
where
    F: Fn(TrackingSnapshot) + Send + 'static,
{
    if opts.depth_mode == DepthMode::Disabled {
        return Err(TrackingError::DepthUnavailable);
    }
    if opts.update_hz <= 0.0 {
        return Err(TrackingError::Init(format!(
            "update rate must be positive, got {}",
            opts.update_hz
        )));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let intrinsics = Intrinsics::for_resolution(frame_size.0, frame_size.1);

    let handle = thread::Builder::new()
        .name("tracking-session".into())
        .spawn(move || {
            debug!(
                plane_detection = ?opts.plane_detection,
                light_estimation = ?opts.light_estimation,
                "synthetic tracking session started"
            );
            session_loop(opts, intrinsics, thread_stop, on_update);
        })
        .map_err(|err| TrackingError::Init(err.to_string()))?;

    Ok(SessionHandle {
        stop,
        thread: Some(handle),
    })
}

fn session_loop<F>(
    opts: TrackingOptions,
    intrinsics: Intrinsics,
    stop: Arc<AtomicBool>,
    on_update: F,
) where
    F: Fn(TrackingSnapshot),
{
    let interval = Duration::from_secs_f64(1.0 / opts.update_hz);
    let mut next_deadline = Instant::now();
    let mut tick: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_deadline {
            thread::sleep(next_deadline - now);
        }
        next_deadline += interval;

        on_update(synthesize_snapshot(tick, intrinsics));
        tick = tick.wrapping_add(1);
    }
}

/// A slowly drifting pose over a gently undulating depth field.
fn synthesize_snapshot(tick: u64, intrinsics: Intrinsics) -> TrackingSnapshot {
    let t = tick as f32 * 0.02;
    let pose = Isometry3::from_parts(
        Translation3::new(0.05 * t.sin(), 0.0, 0.02 * t),
        UnitQuaternion::from_euler_angles(0.0, 0.01 * t.sin(), 0.0),
    );

    let mut cells = Vec::with_capacity(DEPTH_GRID_W * DEPTH_GRID_H);
    for gy in 0..DEPTH_GRID_H {
        for gx in 0..DEPTH_GRID_W {
            // Ground plane sloping away from the camera: near rows (bottom of
            // the image) are close, far rows recede. The sky third of the
            // image carries no estimate.
            if gy < DEPTH_GRID_H / 3 {
                cells.push(f32::NAN);
            } else {
                let row_frac = gy as f32 / DEPTH_GRID_H as f32;
                let base = 1.0 + 9.0 * (1.0 - row_frac);
                let ripple = 0.1 * (gx as f32 * 0.7 + t).sin();
                cells.push(base + ripple);
            }
        }
    }

    TrackingSnapshot {
        timestamp_ms: Utc::now().timestamp_millis(),
        pose,
        intrinsics,
        depth: DepthMap::new(DEPTH_GRID_W, DEPTH_GRID_H, cells),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn session_delivers_snapshots_until_stopped() {
        let (tx, rx) = mpsc::channel();
        let mut session = spawn_synthetic_session(
            TrackingOptions {
                update_hz: 120.0,
                ..TrackingOptions::default()
            },
            (640, 480),
            move |snapshot| {
                let _ = tx.send(snapshot.timestamp_ms);
            },
        )
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(second >= first);

        session.stop();
        assert!(session.is_stopped());
    }

    #[test]
    fn disabled_depth_is_rejected_at_configure_time() {
        let result = spawn_synthetic_session(
            TrackingOptions {
                depth_mode: DepthMode::Disabled,
                ..TrackingOptions::default()
            },
            (640, 480),
            |_| {},
        );
        assert!(matches!(result, Err(TrackingError::DepthUnavailable)));
    }

    #[test]
    fn synthetic_depth_has_near_ground_and_empty_sky() {
        let snap = synthesize_snapshot(0, Intrinsics::for_resolution(640, 480));
        // Bottom-center of the image sits on the near ground plane.
        let near = snap.distance_at(320.0, 470.0, 640.0, 480.0).unwrap();
        assert!(near < 3.0, "near ground reads {near} m");
        // Top of the image is untracked sky.
        assert!(snap.distance_at(320.0, 10.0, 640.0, 480.0).is_none());
    }
}
