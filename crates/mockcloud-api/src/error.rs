//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured error payloads returned by the REST API."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mockcloud_core::{ResourceKind, ServiceError};
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    resource_type: Option<ResourceKind>,
    resource_id: Option<Uuid>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
            resource_type: None,
            resource_id: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let (status, code) = match &err {
            ServiceError::NotFound { .. } => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND"),
            ServiceError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ServiceError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
            ServiceError::Conflict { .. } => (StatusCode::CONFLICT, "RESOURCE_CONFLICT"),
            ServiceError::InvalidTransition { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INVALID_TRANSITION")
            }
            ServiceError::Unavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
        };
        let (resource_type, resource_id) = match err.resource() {
            Some((kind, id)) => (Some(kind), id),
            None => (None, None),
        };
        Self {
            status,
            code,
            message: err.to_string(),
            resource_type,
            resource_id,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<Uuid>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if self.code == "INVALID_TRANSITION" {
                error!(code = self.code, message = %self.message, "lifecycle invariant violated");
            } else {
                warn!(code = self.code, message = %self.message, "request could not be served");
            }
        }
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
                status_code: self.status.as_u16(),
                resource_type: self.resource_type.map(ResourceKind::label),
                resource_id: self.resource_id,
            },
        });
        (self.status, body).into_response()
    }
}
