//! # tape-core
//!
//! Core crate for the tape market-data collector, providing:
//!
//! - **Types** (`types`) — venues, sides, book maps, subscriber callbacks
//! - **Order book** (`book`) — price-keyed maps with the consistency gate
//! - **Errors** (`error`) — domain-specific [`TapeError`] via thiserror
//! - **WebSocket** (`ws`) — transport adapter + connection supervisor
//! - **Configuration** (`config`) — symbol-mapping file parsing
//! - **Time utilities** (`time_util`) — µs timestamps, ISO-8601 parsing
//! - **Logging** (`logging`) — tracing-based structured logging
//!
//! [`TapeError`]: error::TapeError

pub mod book;
pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
