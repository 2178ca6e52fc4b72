//! Listeners and the handler seam between the HTTP layer and the services.

pub mod listener;

use async_trait::async_trait;

use crate::http::request::Request;
use crate::http::response::Response;

/// Turns one parsed request into one response.
///
/// Implementations report failures as responses; a handler never tears the
/// connection down.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}
