//! AR tracking session collaborator.
//!
//! A tracking session produces [`TrackingSnapshot`]s (a timestamped camera
//! pose plus a dense depth estimate) on its own thread, invoking the update
//! callback once per tracked frame. Session features ([`TrackingOptions`])
//! are fixed at configure time. The snapshot type carries the
//! back-projection used to turn an image point into a metric distance.

mod session;
mod types;

pub use session::{spawn_synthetic_session, SessionHandle};
pub use types::{
    DepthMap, DepthMode, Intrinsics, LightEstimationMode, PlaneDetectionMode, TrackingError,
    TrackingOptions, TrackingSnapshot,
};
