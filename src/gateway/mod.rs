//! The live gateway: the inbound HTTP server and the reload orchestrator feeding it tables.

pub mod reload;
pub mod server;

pub use reload::{ActiveTable, ReloadHook, ReloadOrchestrator, ServingState};
pub use server::{dispatch, shutdown_signal, GatewayServer, ServerState};
