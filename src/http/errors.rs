//! Maps `crate::Error` to HTTP status codes and the `{error, detail?}` body
//! shape. This is the only place a variant is turned into a wire
//! response; every handler just returns `crate::Result<HttpResponse>`.

use crate::error::Error;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let (status, label) = match self {
            Error::BadInput(_) => (actix_web::http::StatusCode::BAD_REQUEST, "bad_input"),
            Error::NotFound(_) => (actix_web::http::StatusCode::NOT_FOUND, "not_found"),
            Error::Unauthorized(_) => (actix_web::http::StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::RateLimited { .. } => (actix_web::http::StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Error::Timeout(_) => (actix_web::http::StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Error::Upstream(_) => (actix_web::http::StatusCode::BAD_GATEWAY, "upstream_error"),
            Error::Conflict(_) => (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "conflict"),
            Error::Corrupt(_) => (actix_web::http::StatusCode::BAD_REQUEST, "corrupt"),
            Error::Internal(_) => (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        // Internal details never leak verbatim; everything else is a short
        // human reason.
        let detail = match self {
            Error::Internal(_) | Error::Conflict(_) => None,
            other => Some(other.to_string()),
        };

        HttpResponse::build(status).json(ErrorBody { error: label.to_string(), detail })
    }
}
