//! Central error-to-HTTP mapping.
//!
//! Every handler error goes through this mapper: redirects become 307
//! with a `Location` header, taxonomy errors their status code, anything
//! else a 500. Error bodies are JSON `{"Error": "<message>"}`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use starter_core::errors::Error;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    #[serde(rename = "Error")]
    pub error: String,
}

/// Handler error carrying a starter taxonomy error.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Shorthand for a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::BadRequest(message.into()))
    }
}

/// Build a JSON error response with the given status.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    let message = if message.is_empty() {
        "Unknown error"
    } else {
        message
    };
    let body = serde_json::to_string(&ErrorResponse {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| r#"{"Error":"Unknown error"}"#.to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if let Some(location) = err.redirect_location() {
            return (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location.to_string())],
            )
                .into_response();
        }
        let status = match &err {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Status(code, _) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::PreconditionFailed("x".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                Error::ServiceUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Status(418, "teapot".into()), StatusCode::IM_A_TEAPOT),
            (
                Error::Transient("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_redirect_carries_location() {
        let response =
            ApiError(Error::Redirect("http://10.0.0.1:8528/endpoints".into())).into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "http://10.0.0.1:8528/endpoints"
        );
    }

    #[test]
    fn test_error_body_is_json() {
        let response = error_response(StatusCode::BAD_REQUEST, "SlaveID must be set.");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
