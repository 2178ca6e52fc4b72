//! Sentinel Edge - caching reverse proxy with a built-in service registry
//!
//! Core library for HTTP, proxy, cache and registry functionality. All shared
//! state lives in an external key-value store (see [`store`]); the gateway
//! and the registry are stateless façades over it.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod store;
