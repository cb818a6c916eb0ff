use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Codec/extension table is empty, incomplete or inconsistent
    #[error("Capability error: {0}")]
    CapabilityError(String),

    /// A feedback interceptor could not be constructed
    #[error("Pipeline error [{stage}]: {reason}")]
    PipelineError { stage: String, reason: String },

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Media source could not be opened or decoded
    #[error("Playout error: {0}")]
    PlayoutError(String),

    /// Underlying media transport (ICE/DTLS/SDP) failure
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn pipeline(stage: impl ToString, reason: impl ToString) -> Self {
        Self::PipelineError {
            stage: stage.to_string(),
            reason: reason.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        // WHEP clients only distinguish success from failure
        StatusCode::BAD_REQUEST
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %self,
            "Request failed"
        );

        status.into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
