// Streaming error taxonomy and its HTTP mapping. Only pre-header failures land here;
// after headers, failures are io errors inside the body stream.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::access::gate::Denial;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Content not found")]
    ContentNotFound,
    #[error("No video available for this content")]
    NoVideo,
    #[error("Access denied: {0}")]
    AccessDenied(Denial),
    #[error("Invalid origin url: {0}")]
    InvalidOrigin(String),
    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),
    #[error("Upstream did not respond within {0:?}")]
    UpstreamTimeout(std::time::Duration),
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::ContentNotFound | StreamError::NoVideo => StatusCode::NOT_FOUND,
            StreamError::AccessDenied(_) => StatusCode::FORBIDDEN,
            StreamError::InvalidOrigin(_)
            | StreamError::UpstreamConnect(_)
            | StreamError::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
            StreamError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            StreamError::AccessDenied(_) => "Subscription required".to_string(),
            StreamError::Internal(_) => "Failed to stream content".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Denial>,
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        if let StreamError::Internal(e) = &self {
            tracing::error!("stream internal error: {:#}", e);
        }
        // A failed relay must not hand the player anything it could mistake for media.
        if self.status() == StatusCode::BAD_GATEWAY {
            return StatusCode::BAD_GATEWAY.into_response();
        }
        let reason = match &self {
            StreamError::AccessDenied(denial) => Some(*denial),
            _ => None,
        };
        let body = ErrorBody {
            error: self.public_message(),
            reason,
        };
        (self.status(), Json(body)).into_response()
    }
}
