//! Resilience seam
//!
//! The router makes exactly one forwarding attempt per call it hands to a
//! [`ResiliencePolicy`]. Retries, backoff and circuit breaking belong to the
//! policy, which is injected at construction; [`PassThrough`] is the default
//! and runs the attempt once.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::http::response::Response;

/// One forwardable call. `attempt` may be invoked any number of times.
#[async_trait]
pub trait ForwardCall: Send + Sync {
    async fn attempt(&self) -> Result<Response, GatewayError>;

    /// Backend display name, for policy logging.
    fn backend(&self) -> &str;
}

#[async_trait]
pub trait ResiliencePolicy: Send + Sync {
    async fn execute(&self, call: &dyn ForwardCall) -> Result<Response, GatewayError>;
}

/// Runs every call exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl ResiliencePolicy for PassThrough {
    async fn execute(&self, call: &dyn ForwardCall) -> Result<Response, GatewayError> {
        call.attempt().await
    }
}
