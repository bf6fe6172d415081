//! Error taxonomy for the frame pipeline and its HTTP mapping

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::capture::decoder::ConversionError;
use crate::capture::sensor::SensorError;
use crate::settings::StoreError;

/// Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pipeline is not in `Started`
    #[error("camera pipeline is not started")]
    NotStarted,

    /// Lifecycle operation before a successful init
    #[error("camera is not initialized")]
    NotInitialized,

    /// No frame arrived within the wait bound
    #[error("no frame available within {0} ms")]
    CaptureTimeout(u64),

    /// Hardware handed us an empty or corrupt frame
    #[error("captured frame buffer is invalid")]
    CaptureBufferInvalid,

    #[error("frame conversion failed: {0}")]
    ConversionFailed(#[from] ConversionError),

    /// Snapshot or second stream while a stream holds the camera
    #[error("a stream is already active")]
    StreamingConflict,

    /// Teardown/rebuild did not complete; terminal until a fresh init
    #[error("reinitialization failed: {0}")]
    ReinitFailed(String),

    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("stop failed: {0}")]
    StopFailed(String),

    /// Request body that is not valid JSON or has the wrong shape
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{field} out of range: {reason}")]
    SettingOutOfRange { field: &'static str, reason: String },

    #[error("sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("settings store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Machine-readable reason string
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NotStarted => "NOT_STARTED",
            PipelineError::NotInitialized => "NOT_INITIALIZED",
            PipelineError::CaptureTimeout(_) => "CAPTURE_TIMEOUT",
            PipelineError::CaptureBufferInvalid => "CAPTURE_BUFFER_INVALID",
            PipelineError::ConversionFailed(_) => "CONVERSION_FAILED",
            PipelineError::StreamingConflict => "STREAMING_CONFLICT",
            PipelineError::ReinitFailed(_) => "REINIT_FAILED",
            PipelineError::StartFailed(_) => "START_FAILED",
            PipelineError::StopFailed(_) => "STOP_FAILED",
            PipelineError::BadRequest(_) => "BAD_REQUEST",
            PipelineError::SettingOutOfRange { .. } => "SETTING_OUT_OF_RANGE",
            PipelineError::Sensor(_) => "SENSOR_ERROR",
            PipelineError::Store(_) => "STORE_ERROR",
            PipelineError::Task(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::StreamingConflict => StatusCode::CONFLICT,
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::SettingOutOfRange { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Sensor(_) | PipelineError::Store(_) | PipelineError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub(crate) fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        PipelineError::SettingOutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

impl From<JsonRejection> for PipelineError {
    fn from(rejection: JsonRejection) -> Self {
        PipelineError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(status = %status, error = code, %message, "request failed");
        } else {
            tracing::warn!(status = %status, error = code, %message, "request rejected");
        }

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_distinct_statuses() {
        assert_eq!(
            PipelineError::StreamingConflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            PipelineError::NotStarted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PipelineError::CaptureTimeout(1000).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            PipelineError::out_of_range("quality", "must be 0-63").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            PipelineError::BadRequest("expected value".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(PipelineError::NotStarted.code(), "NOT_STARTED");
        assert_eq!(
            PipelineError::ReinitFailed("probe".into()).code(),
            "REINIT_FAILED"
        );
        assert_eq!(PipelineError::BadRequest(String::new()).code(), "BAD_REQUEST");
    }
}
