//! Typed error definitions for the collector.
//!
//! Provides [`TapeError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement
//! `std::error::Error` via `thiserror`, so they integrate seamlessly with
//! `anyhow::Result` at the application seams.
//!
//! The variants follow the failure taxonomy of the system: configuration
//! problems are fatal at startup, transport problems are retried by the
//! connection supervisor, protocol problems halt one venue for good, parse
//! and API problems are reported and skipped, archive problems drop one
//! record.

use thiserror::Error;

/// Domain-specific errors for the market-data collector.
#[derive(Debug, Error)]
pub enum TapeError {
    /// Configuration parsing or validation error. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket or network transport error. The supervisor restarts the
    /// connection with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire-protocol violation (e.g. unexpected welcome version). Fatal for
    /// the venue's supervisor; no automatic retry.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single frame could not be parsed. The frame is dropped.
    #[error("parse error: {0}")]
    Parse(String),

    /// A venue REST request failed (e.g. Kraken `E*` error entries). The
    /// polling worker stays alive for the next tick.
    #[error("api error: {0}")]
    Api(String),

    /// Archive file I/O error. The record is dropped, the writer stays alive.
    #[error("archive error: {0}")]
    Archive(String),
}

impl TapeError {
    /// Whether this error must halt the venue's supervisor instead of being
    /// retried. Only wire-protocol violations qualify: the venue changed its
    /// protocol and reconnecting would fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TapeError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_protocol_errors_are_fatal() {
        assert!(TapeError::Protocol("bad version".into()).is_fatal());
        assert!(!TapeError::Transport("reset".into()).is_fatal());
        assert!(!TapeError::Parse("bad json".into()).is_fatal());
        assert!(!TapeError::Api("EGeneral:Invalid".into()).is_fatal());
        assert!(!TapeError::Archive("disk full".into()).is_fatal());
    }

    #[test]
    fn display_includes_domain() {
        let e = TapeError::Api("EQuery:Unknown asset pair".into());
        assert_eq!(e.to_string(), "api error: EQuery:Unknown asset pair");
    }
}
