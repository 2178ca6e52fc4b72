//! Gateway error taxonomy and its mapping onto HTTP responses.

use thiserror::Error;

use crate::http::request::Method;
use crate::http::response::{Response, StatusCode};
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Why the gateway could not produce a backend response.
///
/// Every variant is a per-request failure; none of them is fatal to the
/// process.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches {method} {path}")]
    NoRoute { method: Method, path: String },

    #[error("no registered instance of service {0:?}")]
    NoInstances(String),

    /// The forwarded call failed, timed out or returned garbage.
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        backend: String,
        reason: String,
        timed_out: bool,
    },

    #[error("invalid backend target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(e) => GatewayError::StoreUnavailable(e),
            RegistryError::Validation(msg) => GatewayError::InvalidTarget(msg),
        }
    }
}

impl GatewayError {
    pub fn backend_unavailable(backend: impl Into<String>, error: &anyhow::Error) -> Self {
        let timed_out = error
            .chain()
            .any(|cause| cause.is::<tokio::time::error::Elapsed>());
        GatewayError::BackendUnavailable {
            backend: backend.into(),
            reason: format!("{:#}", error),
            timed_out,
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, GatewayError::BackendUnavailable { .. })
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRoute { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoInstances(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendUnavailable { timed_out: true, .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidTarget(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The response sent to the client. Backend details stay in the logs.
    pub fn to_response(&self) -> Response {
        let body = match self {
            GatewayError::NoRoute { .. } => "404 Not Found",
            GatewayError::NoInstances(_) => {
                "503 Service Unavailable\r\n\r\nNo backend servers are available."
            }
            GatewayError::BackendUnavailable { timed_out: true, .. } => {
                "504 Gateway Timeout\r\n\r\nThe backend server did not respond in time."
            }
            GatewayError::BackendUnavailable { .. } | GatewayError::InvalidTarget(_) => {
                "502 Bad Gateway\r\n\r\nFailed to connect to backend server."
            }
            GatewayError::StoreUnavailable(_) => {
                "503 Service Unavailable\r\n\r\nService discovery is unavailable."
            }
        };
        Response::text(self.status(), body)
    }
}
