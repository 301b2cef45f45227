//! Proxy implementation.
//!
//! This module provides the request handling core:
//! - [`Dispatcher`] - Authenticates each request and routes it
//! - CONNECT tunnels relaying raw bytes to the target
//! - HTTP forwarding to origin servers
//! - [`ProxyServer`] - Accept loop, plaintext or TLS

pub mod auth;
mod dispatcher;
mod headers;
mod http_proxy;
mod response;
mod server;
pub mod tls;
mod tunnel;

pub use auth::ProxyCredential;
pub use dispatcher::Dispatcher;
pub use http_proxy::ForwardEngine;
pub use server::ProxyServer;
pub use tunnel::TunnelEngine;
