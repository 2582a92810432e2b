//! Preview server exposing the latest fused artifact.
//!
//! Runs on a dedicated thread so the pipeline hot path never touches the
//! Actix runtime. Serves the annotated frame, an MJPEG stream, obstacle
//! JSON (single-shot and SSE), and the Prometheus registry.

use std::time::Duration;

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde_json::to_string;
use tokio::sync::oneshot;
use tracing::error;

use perception::{telemetry, FusedArtifact, ObstaclesResponse, SharedArtifact};

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><title>obstacle-sentry</title></head>
<body style="margin:0;background:#111;color:#eee;font-family:monospace">
<img src="/stream.mjpg" style="width:100%"/>
<p style="padding:4px">endpoints: /artifact.jpg /obstacles /obstacles/stream /metrics</p>
</body>
</html>
"#;

/// Shared state backing HTTP handlers.
struct ServerState {
    latest: SharedArtifact,
}

/// Handle for the preview server thread.
#[derive(Default)]
pub struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
pub fn spawn_preview_server(latest: SharedArtifact, port: u16) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("sentry-preview".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            latest: latest.clone(),
                        }))
                        .route("/", web::get().to(index_route))
                        .route("/artifact.jpg", web::get().to(artifact_handler))
                        .route("/stream.mjpg", web::get().to(stream_handler))
                        .route("/obstacles", web::get().to(obstacles_handler))
                        .route("/obstacles/stream", web::get().to(stream_obstacles_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(("0.0.0.0", port))?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("preview server error: {err}");
            }
        })
        .context("failed to spawn preview server thread")?;
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn latest_artifact(latest: &SharedArtifact) -> Option<FusedArtifact> {
    latest.lock().ok().and_then(|guard| guard.clone())
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Return the most recent annotated frame.
async fn artifact_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_artifact(&state.latest) {
        Some(artifact) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(artifact.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream annotated frames over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        loop {
            interval.tick().await;
            if let Some(artifact) = latest_artifact(&state.latest) {
                let mut payload = Vec::with_capacity(artifact.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", artifact.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&artifact.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Return the most recent obstacle snapshot as JSON.
async fn obstacles_handler(state: web::Data<ServerState>) -> HttpResponse {
    let guard = match state.latest.lock() {
        Ok(guard) => guard,
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    if let Some(ref artifact) = *guard {
        HttpResponse::Ok().json(ObstaclesResponse {
            timestamp_ms: artifact.timestamp_ms,
            frame_number: artifact.frame_number,
            fps: artifact.metrics.fps,
            inference_latency_ms: artifact.metrics.inference_latency_ms,
            obstacles: &artifact.reports,
        })
    } else {
        HttpResponse::NoContent().finish()
    }
}

/// Stream obstacle snapshots as Server-Sent Events.
async fn stream_obstacles_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            if let Some(artifact) = latest_artifact(&state.latest) {
                let payload = ObstaclesResponse {
                    timestamp_ms: artifact.timestamp_ms,
                    frame_number: artifact.frame_number,
                    fps: artifact.metrics.fps,
                    inference_latency_ms: artifact.metrics.inference_latency_ms,
                    obstacles: &artifact.reports,
                };
                match to_string(&payload) {
                    Ok(json) => {
                        let chunk = format!(
                            "id: {}\ndata: {}\n\n",
                            artifact.frame_number, json
                        );
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                }
            } else {
                yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .streaming(stream)
}

/// Render the Prometheus registry.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
