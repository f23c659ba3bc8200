use crate::services::{
    decoder::DecodeError,
    lifecycle::ServiceError,
    network::NetworkConfig,
    store::StoreError,
};
use actix_web::{HttpResponse, http::StatusCode};
use log::{error, warn};
use serde::Serialize;
use std::fmt::Display;

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for String {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().body(self)
    }
}

impl ServiceResultResponse for NetworkConfig {
    fn into_response(self) -> HttpResponse {
        json_response(&self, "NetworkConfig")
    }
}

/// HTTP status an error is reported with
pub trait ErrorStatus: Display {
    fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl ErrorStatus for anyhow::Error {}

impl ErrorStatus for DecodeError {
    fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

impl ErrorStatus for StoreError {
    fn status(&self) -> StatusCode {
        match self {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorStatus for ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotReady { .. } | ServiceError::NotBound => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::StateConflict { .. } => StatusCode::CONFLICT,
            ServiceError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Credential(_) | ServiceError::Listener { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub fn json_response<T: Serialize>(value: &T, name: &str) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(json) => HttpResponse::Ok()
            .content_type("application/json")
            .body(json),
        Err(e) => {
            error!("failed to serialize {name}: {e:#}");
            HttpResponse::InternalServerError().body("failed to serialize response")
        }
    }
}

/// Convert a service result into a response
///
/// Successful data is rendered by its [`ServiceResultResponse`] impl, errors
/// are logged and answered with the status of their [`ErrorStatus`] impl.
pub fn handle_service_result<T, E>(result: Result<T, E>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
    E: ErrorStatus,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            let status = e.status();

            if status.is_server_error() {
                error!("{operation} failed: {e:#}");
            } else {
                warn!("{operation} rejected: {e}");
            }

            HttpResponse::build(status).body(e.to_string())
        }
    }
}
