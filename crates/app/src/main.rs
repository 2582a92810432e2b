mod server;

use std::sync::{atomic::Ordering, Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use detect_core::{DetectionBatch, InferenceError, ObstacleModel};
use frame_ingest::Frame;
use perception::{
    telemetry, Collaborators, LatestArtifactSink, ModelFactory, PerceptionCliArgs,
    PerceptionConfig, PerceptionController, SourceKind, TrackingSessionHandle,
};

/// Real-time obstacle detection with AR distance fusion.
#[derive(Debug, Parser)]
#[command(name = "obstacle-sentry", version)]
struct Cli {
    #[command(flatten)]
    pipeline: PerceptionCliArgs,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();
    let config = PerceptionConfig::try_from(cli.pipeline).context("invalid configuration")?;

    let sink = Arc::new(LatestArtifactSink::new());
    let shared = sink.shared();

    let collaborators = build_collaborators(&config, sink)?;
    let controller = PerceptionController::new(config.clone(), collaborators)?;

    let shutdown = controller.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    let preview = server::spawn_preview_server(shared, config.preview_port)?;
    info!(
        "preview available at http://127.0.0.1:{}/ (press Ctrl+C to stop)",
        config.preview_port
    );

    let result = controller.run();
    preview.stop();
    result.context("perception pipeline failed")
}

/// Wire the configured camera, tracking, and model collaborators.
fn build_collaborators(
    config: &PerceptionConfig,
    sink: Arc<LatestArtifactSink>,
) -> Result<Collaborators> {
    let capture = config.capture;
    let source: Box<
        dyn Fn() -> Result<frame_ingest::FrameFeed, frame_ingest::CaptureError> + Send + Sync,
    > = match &config.source {
        SourceKind::Synthetic => {
            Box::new(move || Ok(frame_ingest::spawn_synthetic_source(capture)))
        }
        #[cfg(feature = "opencv-capture")]
        SourceKind::Device(uri) => {
            let uri = uri.clone();
            Box::new(move || frame_ingest::spawn_camera_reader(&uri, capture))
        }
        #[cfg(not(feature = "opencv-capture"))]
        SourceKind::Device(_) => {
            anyhow::bail!("camera sources require a build with the `opencv-capture` feature")
        }
    };

    let tracking = config.tracking.map(|opts| {
        let frame_size = (capture.width, capture.height);
        let binder: Box<
            dyn Fn(
                    perception::SnapshotWriter,
                )
                    -> Result<Box<dyn TrackingSessionHandle>, track_ingest::TrackingError>
                + Send
                + Sync,
        > = Box::new(move |slot: perception::SnapshotWriter| {
            let handle = track_ingest::spawn_synthetic_session(opts, frame_size, move |snapshot| {
                slot.write(snapshot);
            })?;
            Ok(Box::new(handle) as Box<dyn TrackingSessionHandle>)
        });
        binder
    });

    let model = model_builder(config)?;

    Ok(Collaborators {
        source,
        tracking,
        model,
        sink,
        errors: perception::log_error_sink(),
    })
}

/// Serves the pipeline when no model is configured: every frame yields an
/// empty result, exercising capture, fusion, and presentation end to end.
struct NullModel;

impl ObstacleModel for NullModel {
    fn infer(&mut self, _frame: &Frame) -> Result<DetectionBatch, InferenceError> {
        Ok(DetectionBatch::default())
    }
}

fn model_builder(
    config: &PerceptionConfig,
) -> Result<Box<dyn Fn() -> ModelFactory + Send + Sync>> {
    match &config.model.model_path {
        None => Ok(Box::new(|| {
            Box::new(|| Ok(Box::new(NullModel) as Box<dyn ObstacleModel>))
        })),
        #[cfg(feature = "with-tch")]
        Some(path) => {
            let opts = detect_core::TorchModelOptions {
                model_path: path.clone(),
                confidence_threshold: config.model.confidence_threshold,
                num_threads: config.model.threads,
                use_accel: config.model.use_accel,
                input_size: (config.capture.width as i64, config.capture.height as i64),
            };
            Ok(Box::new(move || {
                let opts = opts.clone();
                Box::new(move || {
                    let model = detect_core::TorchModel::load(&opts)?;
                    Ok(Box::new(model) as Box<dyn ObstacleModel>)
                })
            }))
        }
        #[cfg(not(feature = "with-tch"))]
        Some(_) => {
            anyhow::bail!("model inference requires a build with the `with-tch` feature")
        }
    }
}
