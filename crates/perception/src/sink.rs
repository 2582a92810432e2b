//! Presentation boundary.
//!
//! The pipeline talks to the UI through plain callbacks; no framework state
//! container is part of the contract. Implementations consume artifacts and
//! metrics but make no calls back into the pipeline.

use std::sync::{Arc, Mutex};

use crate::data::{FusedArtifact, MetricsSnapshot, SharedArtifact};

/// Non-fatal conditions the user should see without the stream stopping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// Tracking never came up or went away; obstacles are reported without
    /// distances until it recovers.
    TrackingUnavailable { reason: String },
}

/// External UI surface. Callbacks are invoked from pipeline worker threads
/// and must not block; the fusion stage never waits on the sink.
pub trait PresentationSink: Send + Sync {
    /// A new artifact replaces whatever was previously displayed.
    fn on_artifact_ready(&self, artifact: FusedArtifact);
    /// Smoothed performance readout, updated once per delivered frame.
    fn on_metrics_updated(&self, metrics: MetricsSnapshot);
    /// Non-blocking user-visible notice.
    fn on_notice(&self, notice: Notice);
}

/// Default sink: keeps only the most recent artifact in a shared slot for
/// pull-based consumers (the preview server reads from here).
pub struct LatestArtifactSink {
    latest: SharedArtifact,
}

impl LatestArtifactSink {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle the preview server can poll.
    pub fn shared(&self) -> SharedArtifact {
        self.latest.clone()
    }

    pub fn latest(&self) -> Option<FusedArtifact> {
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for LatestArtifactSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentationSink for LatestArtifactSink {
    fn on_artifact_ready(&self, artifact: FusedArtifact) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = Some(artifact);
        }
    }

    fn on_metrics_updated(&self, _metrics: MetricsSnapshot) {}

    fn on_notice(&self, notice: Notice) {
        match notice {
            Notice::TrackingUnavailable { reason } => {
                tracing::warn!("tracking unavailable: {reason}");
            }
        }
    }
}
