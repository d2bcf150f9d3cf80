//! Error types for the bridge.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the bridge core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment error: {0}")]
    Mcap(#[from] mcap::McapError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Write attempted against a finalised segment writer.
    #[error("segment already closed")]
    SegmentClosed,

    /// A closed segment file could not be parsed; the file is skipped.
    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: String, reason: String },

    /// No running manager for the requested slug.
    #[error("unknown target slug {0:?}")]
    UnknownSlug(String),

    #[error("layout {0:?} not found")]
    LayoutNotFound(String),

    #[error(transparent)]
    Lookback(#[from] common::LookbackError),

    /// Malformed frame on the upstream subprotocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer went away while we were sending to it.
    #[error("client disconnected")]
    ClientGone,
}
