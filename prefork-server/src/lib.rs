//! HTTP server on top of [`prefork`]: one CPU-pinned worker process per core,
//! each with its own `SO_REUSEPORT` listener and event loop.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod orchestrator;
pub mod reactor;
pub mod socket;

pub use error::{ServerError, ServerResult};
pub use orchestrator::{Outcome, Server, ShutdownReason};
