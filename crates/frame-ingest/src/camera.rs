//! OpenCV-backed camera capture.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{bounded, SendTimeoutError, Sender};
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::types::{CaptureError, CaptureOptions, Frame, FrameFeed, FrameFormat, SourceHandle};

/// Open the device identified by `uri` and spawn a capture thread delivering
/// frames over a small bounded channel.
///
/// Device acquisition happens on the calling thread so permission and
/// hardware faults surface before the feed exists. Frames are resized to the
/// configured capture size and delivered as BGR8.
pub fn spawn_camera_reader(uri: &str, opts: CaptureOptions) -> Result<FrameFeed, CaptureError> {
    let mut cap = open_video_capture(uri)?;
    configure_camera(&mut cap, &opts);

    let (tx, rx) = bounded(2);
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let handle = thread::Builder::new()
        .name("frame-capture".into())
        .spawn(move || {
            if let Err(err) = capture_loop(cap, opts, thread_stop, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(FrameFeed {
        frames: rx,
        handle: SourceHandle::new(stop, handle),
    })
}

fn capture_loop(
    mut cap: VideoCapture,
    opts: CaptureOptions,
    stop: Arc<AtomicBool>,
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = (opts.width, opts.height);

    while !stop.load(Ordering::Relaxed) {
        cap.read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        let mut pending = Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        });
        'deliver: loop {
            match tx.send_timeout(pending, Duration::from_millis(50)) {
                Ok(()) => break 'deliver,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if stop.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    pending = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Ok(()),
            }
        }
    }

    // VideoCapture releases the device when dropped here, on every exit path.
    Ok(())
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply bind-time capture settings (resolution, fps, pixel format, HDR).
fn configure_camera(cap: &mut VideoCapture, opts: &CaptureOptions) {
    if let Ok(fourcc) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, fourcc as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, opts.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, opts.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, opts.fps);
    if opts.hdr {
        // Closest UVC analogue to an HDR extension mode; not every device
        // exposes it.
        if !matches!(cap.set(videoio::CAP_PROP_BACKLIGHT, 1.0), Ok(true)) {
            warn!("HDR extension requested but not supported by the device");
        }
    }
}
