//! Discovery error types.

use crate::discovery::protocol::WireError;

/// Errors surfaced by the discovery facade and engine.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A peer sent bytes that do not decode as protocol messages.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// A published payload does not fit inside a single network frame.
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    /// The engine task is gone; the handle can no longer be used.
    #[error("discovery engine is not running")]
    Stopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
