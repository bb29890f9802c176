//! # API Data Plane Library
//!
//! An API-gateway data plane: inbound HTTP requests are matched against a routing table that is
//! rebuilt from a locally mirrored configuration store, run through a priority-ordered chain of
//! plugins and forwarded to a weighted pool of upstream nodes.
//!
//! ## Control flow
//!
//! ```text
//! config feed ──events──▶ ConfigStore ──hook──▶ ReloadOrchestrator ──▶ RouteBuilder
//!                                                        │
//!                                                        ▼ swap
//! client ──▶ GatewayServer ──▶ RoutingTable ──▶ plugin chain ──▶ ProxyHandler ──▶ upstream
//! ```

/// Settings, shared context, errors, resource types and object pools
pub mod core;

/// Sources of configuration events
pub mod feed;

/// HTTP server and reload orchestration
pub mod gateway;

/// Upstream target selection
pub mod load_balancing;

/// Tracing subscriber setup
pub mod observability;

/// Plugin contract, registry and the built-in plugins
pub mod plugins;

/// Upstream forwarding
pub mod proxy;

/// Routing table and route builder
pub mod routing;

/// Durable local mirror of the remote configuration
pub mod store;

/// Per-request variable namespaces
pub mod variables;

pub use core::config::GatewaySettings;
pub use core::context::GatewayContext;
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::{ActiveTable, GatewayServer, ReloadOrchestrator};
pub use routing::{RouteBuilder, RoutingTable};
pub use store::ConfigStore;
