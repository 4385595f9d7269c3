//! Peer-to-Peer Service-Discovery Fabric
//!
//! This library crate defines the core modules of the discovery fabric.
//! It serves as the foundation for the daemon executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of two loosely coupled subsystems:
//!
//! - **`discovery`**: The gossip engine. Nodes publish small payloads under
//!   string keys, subscribe to keys they care about, and exchange key and
//!   membership advertisements with the peers they know about. There is no
//!   central registry; every node holds a partial, TTL-bounded view of the
//!   cluster built from a configurable seed list.
//! - **`endpoint`**: The message-oriented transport. Frames whole payloads
//!   over TCP with a length prefix and delivers connection lifecycle and
//!   payload events to the engine over a channel.

pub mod discovery;
pub mod endpoint;
