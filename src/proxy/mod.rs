//! Upstream forwarding: the shared transport and the terminal proxy handler.

pub mod handler;
pub mod transport;

pub use handler::{ForwardOptions, ProxyHandler};
pub use transport::{strip_hop_by_hop, UpstreamTransport};
