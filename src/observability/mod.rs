//! # Observability Module
//!
//! Structured logging through `tracing`. Counters are emitted with the `metrics` facade at the
//! call sites; no recorder is installed by the gateway itself.

pub mod logging;

pub use logging::init_logging;
