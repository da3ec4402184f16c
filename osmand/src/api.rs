use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tracker_common::ingest::IngestError;

/// Errors surfaced to OsmAnd clients.
///
/// Responses are plain text. OsmAnd compatible clients only check the status
/// code, the bodies exist for people probing the endpoint with curl.
#[derive(Error, Debug)]
pub enum OsmAndError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Missing id or deviceid")]
    MissingDeviceId,
    #[error("Invalid lat or lon")]
    InvalidCoordinates,
    #[error("Error")]
    Rejected(#[from] IngestError),
}

impl IntoResponse for OsmAndError {
    fn into_response(self) -> Response {
        match self {
            OsmAndError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, self.to_string()),

            OsmAndError::MissingDeviceId | OsmAndError::InvalidCoordinates => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            OsmAndError::Rejected(ref error) if error.is_validation() => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            OsmAndError::Rejected(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
        .into_response()
    }
}
