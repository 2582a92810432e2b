//! Frame orchestration and fusion pipeline for obstacle detection.
//!
//! Three independently clocked sources (camera frames, AR tracking updates,
//! and ML inference) are combined into one low-latency artifact stream.
//! Slow stages never block capture (frames are dropped while an inference is
//! in flight) and stale data is never presented as current (each artifact is
//! fused with the snapshot pinned when its fusion began).
//!
//! The crate is split into focused modules:
//! - `config`: CLI configuration parsing and validation.
//! - `pipeline`: the controller orchestrating capture → detect → fuse.
//! - `schedule`: drop-on-busy admission and the detector worker.
//! - `fusion`: detection/tracking fusion and artifact production.
//! - `latest`: the single-slot last-value-wins snapshot mailbox.
//! - `metrics`: rolling-window fps and smoothed inference latency.
//! - `annotate`: overlay rendering.
//! - `sink`: the presentation boundary.
//! - `watchdog`: stage liveness supervision.
//! - `telemetry`: tracing/metrics bootstrap.
//! - `error`: the fault taxonomy.

pub use config::{ModelConfig, PerceptionCliArgs, PerceptionConfig, SourceKind};
pub use data::{FusedArtifact, MetricsSnapshot, ObstacleReport, ObstaclesResponse, SharedArtifact};
pub use error::{log_error_sink, ConfigError, ErrorEvent, ErrorSink, StartError};
pub use fusion::FusionStage;
pub use latest::LatestSlot;
pub use metrics::MetricsAggregator;
pub use pipeline::{Collaborators, PerceptionController, SnapshotWriter, TrackingSessionHandle};
pub use schedule::{DetectionOutput, FrameTask, InflightGate, ModelFactory};
pub use sink::{LatestArtifactSink, Notice, PresentationSink};

mod annotate;
mod config;
mod data;
mod error;
mod fusion;
mod latest;
mod metrics;
mod pipeline;
mod schedule;
mod sink;
pub mod telemetry;
mod watchdog;
