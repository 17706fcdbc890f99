/// HTTP-facing error type for the daemon.
///
/// Wraps `descartes_kernel_core::KernelError` and maps it to the status
/// codes fixed by the kernel's error design: `Conflict -> 409`,
/// `NotFound -> 404`, `BadRequest -> 400`, `Unauthorized -> 401`,
/// `StoreUnavailable|MigrationFailed -> 503`.
use descartes_kernel_core::KernelError;
use hyper::{Body, Response, StatusCode};
use serde_json::json;
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,
}

impl DaemonError {
    pub fn status(&self) -> StatusCode {
        match self {
            DaemonError::Kernel(KernelError::Conflict(_)) => StatusCode::CONFLICT,
            DaemonError::Kernel(KernelError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Kernel(KernelError::BadRequest { .. }) => StatusCode::BAD_REQUEST,
            DaemonError::Kernel(KernelError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            DaemonError::Kernel(KernelError::StoreUnavailable(_))
            | DaemonError::Kernel(KernelError::MigrationFailed(_, _)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DaemonError::Kernel(KernelError::External(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DaemonError::Unauthorized => StatusCode::UNAUTHORIZED,
            DaemonError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = json!({ "error": self.to_string() }).to_string();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from(body)))
    }
}
