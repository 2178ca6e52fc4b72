//! Registry RPC surface
//!
//! JSON request/response calls over HTTP/1.1 keep-alive:
//!
//! ```text
//! POST     /ServiceDiscovery/RegisterService    ServiceRegistration -> RegisterReply
//! POST|GET /ServiceDiscovery/GetServices        {}                  -> GetServicesReply
//! POST|GET /ServiceDiscovery/Status             {}                  -> StatusReply
//! POST     /ServiceDiscovery/DeregisterService  DeregisterRequest   -> RegisterReply
//! GET      /ServiceDiscovery                    service description (reflection)
//! PUT      /v1/agent/service/register           Consul-style alias of RegisterService
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use super::model::{DeregisterRequest, GetServicesReply, RegisterReply, ServiceRegistration};
use super::service::ServiceRegistry;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::server::Handler;

pub const SERVICE_NAME: &str = "ServiceDiscovery";

pub struct RegistryApi {
    registry: Arc<ServiceRegistry>,
}

impl RegistryApi {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    async fn register(&self, request: &Request) -> Response {
        match serde_json::from_slice::<ServiceRegistration>(&request.body) {
            Ok(registration) => reply(StatusCode::OK, &self.registry.register_service(registration).await),
            Err(e) => reply(
                StatusCode::BAD_REQUEST,
                &RegisterReply::failed(format!("invalid registration payload: {}", e)),
            ),
        }
    }

    async fn deregister(&self, request: &Request) -> Response {
        match serde_json::from_slice::<DeregisterRequest>(&request.body) {
            Ok(req) => reply(
                StatusCode::OK,
                &self.registry.deregister_service(&req.name, &req.id).await,
            ),
            Err(e) => reply(
                StatusCode::BAD_REQUEST,
                &RegisterReply::failed(format!("invalid deregistration payload: {}", e)),
            ),
        }
    }

    async fn get_services(&self) -> Response {
        match self.registry.get_services().await {
            Ok(services) => reply(StatusCode::OK, &GetServicesReply { services }),
            Err(e) => {
                warn!(error = %e, "GetServices failed");
                reply(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &json!({ "error": e.to_string() }),
                )
            }
        }
    }
}

#[async_trait]
impl Handler for RegistryApi {
    async fn handle(&self, request: Request) -> Response {
        let path = request.path_only().trim_end_matches('/');
        let method = request.method;

        let Some(call) = path
            .strip_prefix('/')
            .and_then(|p| p.strip_prefix(SERVICE_NAME))
        else {
            return match (method, path) {
                (Method::PUT, "/v1/agent/service/register") => self.register(&request).await,
                _ => Response::not_found(),
            };
        };

        match (method, call) {
            (Method::GET, "") => reply(StatusCode::OK, &describe()),
            (Method::POST, "/RegisterService") => self.register(&request).await,
            (Method::POST, "/DeregisterService") => self.deregister(&request).await,
            (Method::GET | Method::POST, "/GetServices") => self.get_services().await,
            (Method::GET | Method::POST, "/Status") => reply(StatusCode::OK, &self.registry.status()),
            (_, "" | "/RegisterService" | "/DeregisterService" | "/GetServices" | "/Status") => {
                Response::text(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed")
            }
            _ => Response::not_found(),
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(encoded) => Response::json(status, encoded),
        Err(_) => Response::internal_error(),
    }
}

/// Reflection document describing the RPC methods and their messages.
pub fn describe() -> serde_json::Value {
    let registration = json!({
        "name": "string",
        "id": "string",
        "address": "string",
        "port": "uint16",
        "tags": "string[]",
    });
    let register_reply = json!({ "success": "bool", "message": "string" });

    json!({
        "service": SERVICE_NAME,
        "methods": [
            {
                "name": "RegisterService",
                "path": format!("/{}/RegisterService", SERVICE_NAME),
                "request": registration,
                "response": register_reply,
            },
            {
                "name": "GetServices",
                "path": format!("/{}/GetServices", SERVICE_NAME),
                "request": {},
                "response": { "services": [registration] },
            },
            {
                "name": "Status",
                "path": format!("/{}/Status", SERVICE_NAME),
                "request": {},
                "response": { "message": "string" },
            },
            {
                "name": "DeregisterService",
                "path": format!("/{}/DeregisterService", SERVICE_NAME),
                "request": { "name": "string", "id": "string" },
                "response": register_reply,
            },
        ],
    })
}
