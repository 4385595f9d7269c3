use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::ConnId;

/// Default gossip listen port.
pub const DEFAULT_PORT: u16 = 18888;
/// Default lifetime of an advertisement before fresh gossip must renew it.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 8);
/// Default maintenance period; each tick is randomized around this value.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
/// Default grace period for a connection to complete its handshake.
pub const DEFAULT_CONN_EXP_THRESH: Duration = Duration::from_secs(10);

/// Unique identifier for a node or a published value.
/// Wrapper around a random UUID; totally ordered so id-keyed tables stay
/// sorted and deduplicated by construction.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Uid(pub uuid::Uuid);

impl Uid {
    /// Generates a new random UUID v4-based Uid.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The addresses a single node is reachable on, in preference order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAddress(pub Vec<SocketAddr>);

impl NodeAddress {
    pub fn single(addr: SocketAddr) -> Self {
        Self(vec![addr])
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for addr in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", addr)?;
            first = false;
        }
        Ok(())
    }
}

/// Opaque value bytes. The engine never interprets them.
pub type Payload = Vec<u8>;

/// Caller-chosen identifier for a watch registration on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchHandle(pub u64);

/// Notification delivered to a watch callback.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A value behind the key was fetched.
    Found {
        key: String,
        key_id: Uid,
        payload: Payload,
    },
    /// A previously advertised value expired, was retracted, or could not
    /// be fetched from any node.
    Lost { key: String, key_id: Uid },
}

/// Watch callback. Invoked synchronously on the engine task; panics are
/// caught and logged, never propagated into the engine.
pub type WatchFn = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// An advertised record for a node or a (key, value) association, keyed by
/// its [`Uid`] in the owning table.
#[derive(Debug, Clone)]
pub struct Item {
    /// Where the advertising node can be reached.
    pub addrs: NodeAddress,
    /// Expiration instant on the engine clock, in ms.
    pub expiration: u64,
}

impl Item {
    pub fn new(addrs: NodeAddress, ttl_ms: u64, now_ms: u64) -> Self {
        Self {
            addrs,
            expiration: now_ms + ttl_ms,
        }
    }

    /// Remaining lifetime. Zero once expired.
    pub fn ttl_ms(&self, now_ms: u64) -> u64 {
        self.expiration.saturating_sub(now_ms)
    }

    /// Fresh gossip may only push the expiration out, never pull it in.
    pub fn extend(&mut self, ttl_ms: u64, now_ms: u64) {
        let candidate = now_ms + ttl_ms;
        if candidate > self.expiration {
            self.expiration = candidate;
        }
    }
}

/// A locally published value.
#[derive(Debug, Clone)]
pub struct Data {
    /// Assigned fresh at publish time; peers fetch by this id.
    pub id: Uid,
    pub payload: Payload,
}

impl Data {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uid::random(),
            payload,
        }
    }
}

/// In-flight request for the value behind a `(key, key id)` pair.
#[derive(Debug, Clone)]
pub struct Fetch {
    /// The node the fetch was directed at.
    pub node: NodeAddress,
    /// Current retry backoff. Doubles per retry.
    pub delay_ms: u64,
}

/// Retry-timeline record for a pending fetch.
#[derive(Debug, Clone)]
pub struct FetchExp {
    pub key: String,
    pub key_id: Uid,
    pub expiration: u64,
}

/// Probationary expiration of a connection that has not finished its
/// handshake.
#[derive(Debug, Clone, Copy)]
pub struct ConnExpItem {
    pub conn: ConnId,
    pub deadline: u64,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct ConnState {
    pub conn: ConnId,
    /// True when this side initiated the connection.
    pub outbound: bool,
    /// Protocol version from the peer's handshake; zero until initialized.
    pub version: u32,
    /// Peer identity from the handshake.
    pub node_id: Option<Uid>,
    /// Peer addresses from the handshake.
    pub peer_node: Option<NodeAddress>,
    /// True for connections opened to satisfy fetches; kept out of the
    /// gossip edge set.
    pub is_fetch: bool,
    /// Fetches queued until the handshake completes.
    pub pending_fetch: Vec<(String, Uid)>,
}

impl ConnState {
    pub fn new(conn: ConnId, outbound: bool, is_fetch: bool) -> Self {
        Self {
            conn,
            outbound,
            version: 0,
            node_id: None,
            peer_node: None,
            is_fetch,
            pending_fetch: Vec::new(),
        }
    }

    pub fn initialized(&self) -> bool {
        self.version != 0
    }

    pub fn fetch(&mut self, key: String, key_id: Uid) {
        self.is_fetch = true;
        self.pending_fetch.push((key, key_id));
    }
}

/// Engine table sizes, for the stats surface and end-state assertions.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Known peer nodes.
    pub nodes: usize,
    /// Initialized gossip connections.
    pub edges: usize,
    /// All live connections, handshaken or not.
    pub connections: usize,
    /// Known key advertisements across all keys.
    pub keys: usize,
    /// Registered watches across all keys.
    pub watches: usize,
    /// Locally published values.
    pub data: usize,
    /// In-flight fetches.
    pub fetches: usize,
}

/// Construction-time configuration for a discovery node.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Listen address for the gossip endpoint.
    pub bind: SocketAddr,
    /// Address advertised to peers; defaults to the bound address. Must be
    /// set when binding a wildcard address.
    pub advertise: Option<SocketAddr>,
    /// Static bootstrap addresses.
    pub seeds: Vec<SocketAddr>,
    /// Advertisement lifetime.
    pub ttl: Duration,
    /// Maintenance period (randomized per tick).
    pub period: Duration,
    /// Handshake grace period.
    pub conn_exp_thresh: Duration,
    /// Fixed RNG seed; entropy-seeded when absent.
    pub rng_seed: Option<u64>,
}

impl DiscoveryConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            advertise: None,
            seeds: Vec::new(),
            ttl: DEFAULT_TTL,
            period: DEFAULT_PERIOD,
            conn_exp_thresh: DEFAULT_CONN_EXP_THRESH,
            rng_seed: None,
        }
    }

    pub fn seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn advertise(mut self, addr: SocketAddr) -> Self {
        self.advertise = Some(addr);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn conn_exp_thresh(mut self, thresh: Duration) -> Self {
        self.conn_exp_thresh = thresh;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}
