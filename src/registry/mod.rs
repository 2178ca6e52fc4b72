//! Service registry
//!
//! Backend instances announce themselves with `RegisterService` and the
//! router (or any other client) discovers them with `GetServices`. All state
//! lives in the shared store; [`ServiceRegistry`] is a stateless façade over
//! it and [`RegistryApi`] exposes it as an RPC surface.
//!
//! Lifecycle of one registration:
//!
//! ```text
//! Absent ──register──▶ Registered ──deregister──▶ Absent
//!                        │    ▲
//!                        │    └── register again (heartbeat) refreshes TTL
//!                        └── TTL elapses ──▶ Expired (pruned on next read)
//! ```

pub mod api;
pub mod model;
pub mod service;

pub use api::RegistryApi;
pub use model::{GetServicesReply, RegisterReply, ServiceRegistration, StatusReply};
pub use service::{RegistryError, ServiceRegistry};
