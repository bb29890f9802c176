pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod types;
