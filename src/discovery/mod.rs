//! Peer Discovery Module
//!
//! Implements the decentralized service-discovery engine. Nodes publish
//! small payloads under string keys and watch keys they care about; a
//! gossip protocol over a partial TCP mesh spreads key and membership
//! advertisements until every interested node has seen them.
//!
//! ## Core Mechanisms
//! - **State exchange**: on every new link both sides dump what they know
//!   (keys, nodes, watched-key queries); afterwards only changes travel.
//!   A published value becomes visible cluster-wide in O(diameter · period)
//!   time.
//! - **Fetch-on-demand**: values themselves are never gossiped. A watching
//!   node fetches the payload directly from its publisher, retrying with
//!   exponential backoff, and nothing is cached beyond the metadata.
//! - **TTL expiration**: every advertisement carries a lifetime that fresh
//!   gossip can only extend. Crashed publishers age out of the mesh and
//!   their watchers are told what was lost.
//! - **Topology entropy**: a randomized maintenance tick occasionally drops
//!   a random link and dials new ones, so the mesh keeps mixing instead of
//!   freezing into whatever shape bootstrap produced.

pub mod clock;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod service;
pub mod types;

pub use error::DiscoveryError;
pub use service::{PeerDiscovery, MAX_PAYLOAD_BYTES};
pub use types::{
    DiscoveryConfig, NodeAddress, Payload, Stats, Uid, WatchEvent, WatchHandle, DEFAULT_PORT,
};
