//! HTTP surface of the camera pipeline

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tracing::info;

use crate::capture::frame::FrameSizeRepr;
use crate::error::{PipelineError, Result};
use crate::pipeline::consumer::{self, StreamConsumer};
use crate::pipeline::controller::PipelineStatus;
use crate::pipeline::PipelineController;
use crate::settings::{parse_framesize, CameraSettings, SettingsPatch};

type AppState = Arc<PipelineController>;

/// Parts buffered between the stream thread and the socket
const STREAM_BACKLOG: usize = 2;

/// Build the API router, mounted under `base` (e.g. `/api/camera`).
pub fn router(pipeline: AppState, base: &str) -> Router {
    let api = Router::new()
        .route("/snapshot", get(snapshot))
        .route("/stream", get(stream))
        .route("/status", get(status))
        .route("/settings", get(get_settings).put(put_settings))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/init", post(init))
        .route("/reinitialize", post(reinitialize))
        .with_state(pipeline);

    let base = base.trim_end_matches('/');
    if base.is_empty() {
        api
    } else {
        Router::new().nest(base, api)
    }
}

/// JSON body whose rejections come back in the API's error format.
struct Payload<T>(T);

impl<S, T> FromRequest<S> for Payload<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = PipelineError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Run a blocking pipeline call off the async workers.
async fn blocking<T, F>(pipeline: &AppState, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&PipelineController) -> Result<T> + Send + 'static,
{
    let pipeline = Arc::clone(pipeline);
    tokio::task::spawn_blocking(move || f(&pipeline)).await?
}

async fn snapshot(State(pipeline): State<AppState>) -> Result<Response> {
    let jpeg = blocking(&pipeline, consumer::snapshot).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CONTENT_DISPOSITION, "attachment; filename=capture.jpg"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        jpeg.into_bytes(),
    )
        .into_response())
}

async fn stream(State(pipeline): State<AppState>) -> Result<Response> {
    let session = StreamConsumer::open(pipeline)?;

    let (mut tx, rx) = flume::bounded::<Bytes>(STREAM_BACKLOG);
    tokio::task::spawn_blocking(move || session.run(&mut tx));

    let body = Body::from_stream(rx.into_stream().map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, consumer::stream_content_type()),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}

async fn status(State(pipeline): State<AppState>) -> Json<PipelineStatus> {
    Json(pipeline.status())
}

async fn get_settings(State(pipeline): State<AppState>) -> Json<CameraSettings> {
    Json(pipeline.settings())
}

async fn put_settings(
    State(pipeline): State<AppState>,
    Payload(patch): Payload<SettingsPatch>,
) -> Result<Json<CameraSettings>> {
    let settings = blocking(&pipeline, move |p| p.update_settings(patch)).await?;
    Ok(Json(settings))
}

async fn start(State(pipeline): State<AppState>) -> Result<Json<PipelineStatus>> {
    blocking(&pipeline, |p| p.start()).await?;
    Ok(Json(pipeline.status()))
}

async fn stop(State(pipeline): State<AppState>) -> Result<Json<PipelineStatus>> {
    blocking(&pipeline, |p| p.stop()).await?;
    Ok(Json(pipeline.status()))
}

async fn init(State(pipeline): State<AppState>) -> Result<Json<PipelineStatus>> {
    blocking(&pipeline, |p| p.init()).await?;
    Ok(Json(pipeline.status()))
}

#[derive(Debug, Deserialize)]
struct ReinitializeRequest {
    framesize: FrameSizeRepr,
}

async fn reinitialize(
    State(pipeline): State<AppState>,
    Payload(request): Payload<ReinitializeRequest>,
) -> Result<Json<PipelineStatus>> {
    let framesize = parse_framesize(request.framesize)?;
    info!("Live reinitialization to {} requested", framesize);
    blocking(&pipeline, move |p| p.reinitialize(framesize)).await?;
    Ok(Json(pipeline.status()))
}
