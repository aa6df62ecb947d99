use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use octolab_core::CoreError;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }

    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Maps the core's error taxonomy onto HTTP. `NotFound` is deliberately
/// uniform with "exists but not owned" (the core never distinguishes the
/// two) so a client can't use this endpoint to enumerate other tenants'
/// lab ids. Backend-not-ready surfaces as a flat 400 rather than leaking
/// which Doctor check failed.
impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(_) => ApiError::not_found("lab not found"),
            CoreError::WrongState { .. } => ApiError::conflict(e.to_string()),
            CoreError::RecipeMissing(_) => ApiError::bad_request(e.to_string()),
            CoreError::ProvisioningTimeout(_) => ApiError::internal("provisioning timed out"),
            CoreError::TeardownIncomplete(_) => ApiError::internal("teardown left resources behind"),
            CoreError::Runtime(ref runtime_err) => match runtime_err {
                octolab_runtime::RuntimeError::PortPoolExhausted { .. } => {
                    ApiError::internal("port pool exhausted")
                }
                octolab_runtime::RuntimeError::DoctorFatal(_) => {
                    ApiError::bad_request("backend not ready")
                }
                _ => ApiError::internal("backend command failed"),
            },
            CoreError::Store(_) | CoreError::Domain(_) | CoreError::Hygiene(_) | CoreError::Internal(_) => {
                ApiError::internal("internal error")
            }
        }
    }
}

impl From<octolab_store::StoreError> for ApiError {
    fn from(e: octolab_store::StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}
