//! Throughput and latency aggregation.
//!
//! Frame-delivery and inference-completion events feed a small rolling
//! window; accessors expose smoothed values and never block the recorders
//! for longer than a deque append. The same values are republished as
//! `metrics` gauges for the Prometheus exporter.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use crate::data::MetricsSnapshot;

/// Width of the fps window. Deliveries older than this (relative to the
/// newest delivery) no longer influence the published rate.
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// EWMA coefficient for inference latency, matching the capture-rate
/// smoothing used elsewhere in the pipeline.
const LATENCY_SMOOTHING: f64 = 0.9;

pub struct MetricsAggregator {
    deliveries: Mutex<VecDeque<Instant>>,
    /// Smoothed latency in milliseconds, stored as f64 bits.
    latency_bits: AtomicU64,
    /// Published fps, updated on each delivery.
    fps: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(VecDeque::with_capacity(128)),
            latency_bits: AtomicU64::new(0.0_f64.to_bits()),
            fps: AtomicU64::new(0),
        }
    }

    /// Record one frame delivered by the capture source at `at`.
    pub fn record_frame_delivered(&self, at: Instant) {
        let fps = {
            let mut window = match self.deliveries.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            window.push_back(at);
            let newest = *window.back().expect("just pushed");
            while let Some(oldest) = window.front() {
                if newest.duration_since(*oldest) > FPS_WINDOW {
                    window.pop_front();
                } else {
                    break;
                }
            }
            window.len() as f64 / FPS_WINDOW.as_secs_f64()
        };
        self.fps.store(fps.round() as u64, Ordering::Relaxed);
        metrics::gauge!("sentry_pipeline_fps").set(fps);
    }

    /// Record one completed inference with its wall-clock bounds.
    pub fn record_inference_completed(&self, started: Instant, finished: Instant) {
        let sample_ms = finished.duration_since(started).as_secs_f64() * 1000.0;
        // Lock-free EWMA update; racing completions may drop a sample, which
        // the smoothing absorbs.
        let previous = f64::from_bits(self.latency_bits.load(Ordering::Relaxed));
        let smoothed = if previous == 0.0 {
            sample_ms
        } else {
            LATENCY_SMOOTHING * previous + (1.0 - LATENCY_SMOOTHING) * sample_ms
        };
        self.latency_bits
            .store(smoothed.to_bits(), Ordering::Relaxed);
        metrics::histogram!("sentry_inference_latency_seconds").record(sample_ms / 1000.0);
    }

    /// Deliveries in the rolling window divided by the window span, not the
    /// reciprocal of the last inter-frame gap, so single-frame jitter does
    /// not whip the readout around.
    pub fn current_fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed) as u32
    }

    /// Smoothed (exponentially weighted) inference wall-clock duration.
    pub fn current_inference_latency_ms(&self) -> u64 {
        f64::from_bits(self.latency_bits.load(Ordering::Relaxed)).round() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fps: self.current_fps(),
            inference_latency_ms: self.current_inference_latency_ms(),
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed deliveries at an exact synthetic cadence and check convergence.
    fn feed_at_rate(agg: &MetricsAggregator, start: Instant, hz: u64, seconds: u64) -> Instant {
        let step = Duration::from_nanos(1_000_000_000 / hz);
        let mut at = start;
        for _ in 0..hz * seconds {
            at += step;
            agg.record_frame_delivered(at);
        }
        at
    }

    #[test]
    fn fps_converges_to_delivery_rate() {
        let agg = MetricsAggregator::new();
        feed_at_rate(&agg, Instant::now(), 30, 5);
        let fps = agg.current_fps();
        assert!((28..=32).contains(&fps), "expected ~30 fps, got {fps}");
    }

    #[test]
    fn fps_responds_to_rate_change_within_window() {
        let agg = MetricsAggregator::new();
        let t = feed_at_rate(&agg, Instant::now(), 60, 2);
        assert!((58..=62).contains(&agg.current_fps()));

        // Rate halves; after one full window the old cadence has aged out.
        feed_at_rate(&agg, t, 15, 2);
        let fps = agg.current_fps();
        assert!((13..=17).contains(&fps), "expected ~15 fps, got {fps}");
    }

    #[test]
    fn fps_is_zero_before_any_delivery() {
        let agg = MetricsAggregator::new();
        assert_eq!(agg.current_fps(), 0);
        assert_eq!(agg.current_inference_latency_ms(), 0);
    }

    #[test]
    fn latency_starts_at_first_sample_then_smooths() {
        let agg = MetricsAggregator::new();
        let t0 = Instant::now();
        agg.record_inference_completed(t0, t0 + Duration::from_millis(100));
        assert_eq!(agg.current_inference_latency_ms(), 100);

        // One fast outlier moves the smoothed value only slightly.
        agg.record_inference_completed(t0, t0 + Duration::from_millis(10));
        let smoothed = agg.current_inference_latency_ms();
        assert!(
            (80..100).contains(&smoothed),
            "expected smoothed value near 91, got {smoothed}"
        );
    }

    #[test]
    fn snapshot_carries_both_values() {
        let agg = MetricsAggregator::new();
        let t0 = Instant::now();
        feed_at_rate(&agg, t0, 30, 2);
        agg.record_inference_completed(t0, t0 + Duration::from_millis(42));
        let snap = agg.snapshot();
        assert!(snap.fps > 0);
        assert_eq!(snap.inference_latency_ms, 42);
    }
}
