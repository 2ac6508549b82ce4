//! Centralized error types for signalmesh.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that can be directly converted to responses on the one place
//! this system still speaks plain HTTP (the registration endpoint).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core error type for the SFU, Negotiator, and Gateway.
#[derive(Debug, thiserror::Error)]
pub enum SignalmeshError {
    // === Lookup errors (returned to caller, spec §7) ===
    #[error("peer not registered")]
    PeerNotRegistered,

    #[error("track not found: {0}")]
    TrackNotFound(String),

    #[error("peer already subscribed to track: {0}")]
    AlreadySubscribed(String),

    // === Protocol errors (recoverable, reported via on_error) ===
    #[error("SDP negotiation failed: {0}")]
    Negotiation(String),

    #[error("ICE candidate rejected: {0}")]
    IceCandidate(String),

    #[error("signalling transport closed")]
    SignalerClosed,

    #[error("malformed signal payload: {0}")]
    MalformedPayload(String),

    // === Registration / HTTP surface ===
    #[error("{0} is already registered")]
    NameTaken(String),

    #[error("request validation failed: {0}")]
    Validation(String),

    // === Infrastructure ===
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to HTTP clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl SignalmeshError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PeerNotRegistered | Self::TrackNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadySubscribed(_) | Self::NameTaken(_) => StatusCode::CONFLICT,
            Self::Negotiation(_) | Self::IceCandidate(_) | Self::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SignalerClosed => StatusCode::GONE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::PeerNotRegistered => "PEER_NOT_REGISTERED",
            Self::TrackNotFound(_) => "TRACK_NOT_FOUND",
            Self::AlreadySubscribed(_) => "ALREADY_SUBSCRIBED",
            Self::Negotiation(_) => "NEGOTIATION_FAILED",
            Self::IceCandidate(_) => "ICE_CANDIDATE_REJECTED",
            Self::SignalerClosed => "SIGNALER_CLOSED",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::NameTaken(_) => "NAME_TAKEN",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for SignalmeshError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            SignalmeshError::Internal(e) => {
                tracing::error!("internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type SignalmeshResult<T> = Result<T, SignalmeshError>;
