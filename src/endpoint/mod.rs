//! Message-Oriented Transport Module
//!
//! Provides the framed TCP endpoint the discovery engine runs on. The
//! endpoint owns every socket; the engine only ever sees whole payloads and
//! connection lifecycle events, never byte streams.
//!
//! ## Core Mechanisms
//! - **Length-prefixed framing**: every payload is preceded by a `u32`
//!   big-endian length. Delivery is whole-payload or drop, never partial.
//! - **Connection tokens**: sockets are addressed by opaque [`ConnId`]
//!   values from a process-wide monotonic counter, so a token is never
//!   reused even when the OS recycles file descriptors.
//! - **Buffered connect**: payloads sent right after `connect` are queued
//!   and flushed once the TCP handshake completes, which lets the engine
//!   fire its protocol handshake without waiting for the socket.

pub mod endpoint;
pub mod framing;

pub use endpoint::{ConnId, Endpoint, EndpointCmd, EndpointEvent, EndpointHandle};

#[cfg(test)]
mod tests;
