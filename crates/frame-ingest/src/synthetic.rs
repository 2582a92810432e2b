//! Synthetic frame source used by demos and pipeline tests.
//!
//! Emits a moving gradient pattern at the configured rate so downstream
//! stages can be exercised without camera hardware.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{bounded, SendTimeoutError, Sender};

use crate::types::{CaptureError, CaptureOptions, Frame, FrameFeed, FrameFormat, SourceHandle};

/// Spawn a background thread that emits synthetic frames at `opts.fps`.
///
/// The channel is intentionally small so a stalled consumer backpressures the
/// generator instead of accumulating frames.
pub fn spawn_synthetic_source(opts: CaptureOptions) -> FrameFeed {
    let (tx, rx) = bounded(2);
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let handle = thread::Builder::new()
        .name("frame-synthetic".into())
        .spawn(move || generate_loop(opts, thread_stop, tx))
        .expect("failed to spawn synthetic frame source");

    FrameFeed {
        frames: rx,
        handle: SourceHandle::new(stop, handle),
    }
}

fn generate_loop(
    opts: CaptureOptions,
    stop: Arc<AtomicBool>,
    tx: Sender<Result<Frame, CaptureError>>,
) {
    let interval = Duration::from_secs_f64(1.0 / opts.fps.max(1.0));
    let mut next_deadline = Instant::now();
    let mut sequence: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_deadline {
            thread::sleep(next_deadline - now);
        }
        next_deadline += interval;

        let frame = Frame {
            data: render_pattern(opts.width, opts.height, sequence),
            width: opts.width,
            height: opts.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        };
        sequence = sequence.wrapping_add(1);

        if !deliver(&tx, &stop, Ok(frame)) {
            break;
        }
    }
}

/// Push one frame, backing off on a full buffer so a stop request is still
/// observed while the consumer lags. Returns false when delivery must end.
fn deliver(
    tx: &Sender<Result<Frame, CaptureError>>,
    stop: &AtomicBool,
    message: Result<Frame, CaptureError>,
) -> bool {
    let mut pending = message;
    loop {
        match tx.send_timeout(pending, Duration::from_millis(50)) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                pending = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Scrolling diagonal gradient; cheap to produce and visibly animated.
fn render_pattern(width: i32, height: i32, sequence: u64) -> Vec<u8> {
    let w = width.max(1) as usize;
    let h = height.max(1) as usize;
    let phase = (sequence % 256) as usize;
    let mut data = vec![0u8; w * h * 3];
    for y in 0..h {
        let row = &mut data[y * w * 3..(y + 1) * w * 3];
        for x in 0..w {
            let v = ((x + y + phase) % 256) as u8;
            let px = &mut row[x * 3..x * 3 + 3];
            px[0] = v;
            px[1] = v / 2;
            px[2] = 255 - v;
        }
    }
    data
}
