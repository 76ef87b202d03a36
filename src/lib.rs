//! Viaduct - an event-driven HTTP/1.x and HTTP/2 relay proxy.
//!
//! Viaduct is a name-based relay core built on a **hexagonal architecture**.
//! It accepts plaintext HTTP/1.0, HTTP/1.1 and h2c fronts, routes each
//! request by host name or URL rule, and relays it over a fresh or pooled
//! HTTP/1.1 backend connection. This library exposes the building blocks so
//! you can embed the relay or compose parts of it inside your own
//! application.
//!
//! # Features
//! - HTTP/1.x exchange loop with keep-alive and CONNECT tunnelling
//! - h2c fronts: preface detection, HPACK, per-stream flow control
//! - Host, alias, regex-rule, redirect and forward routing with hot reload
//! - Pluggable origin selection strategies (round-robin, least-pending)
//! - Periodic DNS refresh for symbolic origins
//! - Backend connection pooling with liveness revalidation
//! - Response re-framing: chunked transfer plus optional gzip/deflate
//! - Metrics facade & structured tracing via `tracing`
//! - Graceful shutdown & pairing tracking
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use viaduct::Router;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! // Load a configuration (see demos/configs/*.yaml)
//! let cfg = viaduct::config::loader::load_config("relay.yaml").await?;
//! let router = Arc::new(Router::from_config(&cfg)?);
//! // You would normally hand this to the RelayServer adapter (see binary crate)
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping protocol and routing logic inside `core`. End users should
//! prefer the re-exports documented below instead of reaching into internal
//! modules directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error type.
//! A custom error context is always attached using `WrapErr` for
//! debuggability.
//!
//! # Concurrency & Data Structures
//! For shared mutable maps the project uses `scc::HashMap` instead of
//! `dashmap` to maintain predictable performance characteristics under
//! contention. Routing tables swap atomically through `arc-swap`.
//!
//! # License
//! Licensed under Apache-2.0.
// Re-export public modules with explicit visibility controls
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        HostRefresher, OriginPool, RelayServer, SessionContext, SessionSettings, SystemResolver,
        TcpConnector,
    },
    core::{RouteTable, Router},
    ports::connector::Connector,
    utils::{GracefulShutdown, PairingTracker, ShutdownReason},
};
