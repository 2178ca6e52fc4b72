//! Reverse proxy functionality
//!
//! Route matching, backend resolution (static or through the service
//! registry), request forwarding and response caching.

pub mod backend;
pub mod resilience;
pub mod route;
pub mod router;
pub mod upstream;

pub use backend::{Backend, BackendResolver};
pub use resilience::{ForwardCall, PassThrough, ResiliencePolicy};
pub use route::{PathPattern, Route, RouteCachePolicy, RouteTable, RouteTarget};
pub use router::{CacheStatus, Router};
pub use upstream::Upstream;
