//! The discovery state machine.
//!
//! A single owner (the engine task in `service.rs`, or a test harness)
//! drives this struct with endpoint events, facade commands, and timer
//! ticks. Every table lives here and is only ever touched by that owner;
//! there is not a lock in sight.
//!
//! ## Protocol sketch
//! Connections handshake with `Init`, then exchange `Keys`/`Nodes`
//! snapshots and `Query` the keys they watch. Values are never gossiped,
//! only their advertisements; a watching node `Fetch`es the value straight
//! from its publisher and gets a `Data` reply. The maintenance tick expires
//! stale state, retries fetches with exponential backoff, and keeps the
//! topology moving with random connects and disconnects.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::endpoint::{ConnId, EndpointEvent, EndpointHandle};

use super::clock::Clock;
use super::protocol::{
    DataItem, FetchItem, Handshake, KeyItem, Message, NodeItem, PROTOCOL_VERSION,
};
use super::service::Command;
use super::types::{
    ConnExpItem, ConnState, Data, DiscoveryConfig, Fetch, FetchExp, Item, NodeAddress, Payload,
    Stats, Uid, WatchEvent, WatchFn, WatchHandle,
};

/// Soft target for the gossip edge count. Above it the shaping pass closes
/// a random edge; below it new-node gossip may open one.
const TARGET_EDGES: usize = 8;
/// Odds per tick of closing one random edge even under the target. This is
/// the entropy source that keeps the topology from freezing.
const RANDOM_DISCONNECT_ODDS: u32 = 20;
/// Ceiling for the fetch retry backoff.
const MAX_FETCH_DELAY_MS: u64 = 8192;

pub struct Engine {
    ttl_ms: u64,
    period_ms: u64,
    conn_exp_thresh_ms: u64,

    my_id: Uid,
    my_node: NodeAddress,

    clock: Clock,
    rng: StdRng,
    endpoint: EndpointHandle,

    nodes: BTreeMap<Uid, Item>,
    seeds: Vec<SocketAddr>,

    connections: HashMap<ConnId, ConnState>,
    connected_nodes: HashMap<Uid, ConnId>,
    conn_expiration: VecDeque<ConnExpItem>,
    edges: BTreeSet<ConnId>,

    fetches: HashMap<String, BTreeMap<Uid, Fetch>>,
    fetch_expiration: VecDeque<FetchExp>,

    keys: HashMap<String, BTreeMap<Uid, Item>>,
    watches: HashMap<String, BTreeMap<WatchHandle, WatchFn>>,
    data: HashMap<String, Data>,
}

impl Engine {
    pub(crate) fn new(
        cfg: &DiscoveryConfig,
        my_node: NodeAddress,
        endpoint: EndpointHandle,
        clock: Clock,
    ) -> Self {
        let rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            ttl_ms: cfg.ttl.as_millis() as u64,
            period_ms: cfg.period.as_millis() as u64,
            conn_exp_thresh_ms: cfg.conn_exp_thresh.as_millis() as u64,
            my_id: Uid::random(),
            my_node,
            clock,
            rng,
            endpoint,
            nodes: BTreeMap::new(),
            seeds: cfg.seeds.clone(),
            connections: HashMap::new(),
            connected_nodes: HashMap::new(),
            conn_expiration: VecDeque::new(),
            edges: BTreeSet::new(),
            fetches: HashMap::new(),
            fetch_expiration: VecDeque::new(),
            keys: HashMap::new(),
            watches: HashMap::new(),
            data: HashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> Uid {
        self.my_id
    }

    pub(crate) fn node(&self) -> &NodeAddress {
        &self.my_node
    }

    /// Bootstrap: dial the seed list without waiting for the first tick.
    pub(crate) fn start(&mut self) {
        info!("discovery engine {} up on {}", self.my_id, self.my_node);
        self.seed_connect();
    }

    /// Next maintenance delay, randomized in `[period/2, period*3/2]` so a
    /// cluster started in lockstep does not tick in lockstep.
    pub(crate) fn next_period_ms(&mut self) -> u64 {
        self.period_ms / 2 + self.rng.gen_range(0..=self.period_ms)
    }

    // ------------------------------------------------------------
    // Event and command entry points
    // ------------------------------------------------------------

    pub(crate) fn handle_event(&mut self, ev: EndpointEvent) {
        match ev {
            EndpointEvent::Opened {
                conn,
                peer,
                outbound,
            } => self.on_opened(conn, peer, outbound),
            EndpointEvent::Closed { conn } => self.remove_conn(conn),
            EndpointEvent::Payload { conn, bytes } => self.on_payload(conn, &bytes),
            EndpointEvent::Dropped { conn } => {
                debug!("payload dropped on dead {}", conn);
            }
        }
    }

    pub(crate) fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Discover { key, handle, watch } => self.discover(key, handle, watch),
            Command::Forget { key, handle } => self.forget(&key, handle),
            Command::Lost { key, key_id } => self.lost(&key, key_id),
            Command::Publish { key, payload } => self.publish(key, payload),
            Command::Retract { key } => self.retract(&key),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {}
        }
    }

    // ------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------

    fn on_opened(&mut self, conn: ConnId, peer: Option<SocketAddr>, outbound: bool) {
        if outbound {
            // Registered when we initiated; if probation already reaped it,
            // the late socket is not wanted.
            if !self.connections.contains_key(&conn) {
                self.endpoint.close(conn);
            }
            return;
        }

        debug!("accepted {} from {:?}", conn, peer);
        self.register_conn(conn, false, false);
    }

    /// Track a fresh connection, arm its handshake probation, and send our
    /// half of the handshake. Sends on a still-connecting socket are
    /// buffered by the endpoint.
    fn register_conn(&mut self, conn: ConnId, outbound: bool, is_fetch: bool) {
        let now = self.clock.now_ms();
        self.connections
            .insert(conn, ConnState::new(conn, outbound, is_fetch));
        self.conn_expiration.push_back(ConnExpItem {
            conn,
            deadline: now + self.conn_exp_thresh_ms,
        });
        self.send_one(
            conn,
            &Message::Init(Handshake {
                version: PROTOCOL_VERSION,
                node_id: self.my_id,
                node: self.my_node.clone(),
            }),
        );
    }

    /// Open an outbound connection to a node, trying its addresses in order.
    fn connect_to(&mut self, addrs: &NodeAddress, is_fetch: bool) -> ConnId {
        let conn = self.endpoint.connect(addrs.0.clone());
        debug!("dialing {} as {}", addrs, conn);
        self.register_conn(conn, true, is_fetch);
        conn
    }

    /// Engine-initiated close.
    fn disconnect(&mut self, conn: ConnId) {
        self.endpoint.close(conn);
        self.remove_conn(conn);
    }

    /// Forget a connection. Fetch and watch state is deliberately retained;
    /// fetches are reissued by the retry timeline or the next Keys message.
    fn remove_conn(&mut self, conn: ConnId) {
        let Some(state) = self.connections.remove(&conn) else {
            return;
        };
        if let Some(node_id) = state.node_id {
            if self.connected_nodes.get(&node_id) == Some(&conn) {
                self.connected_nodes.remove(&node_id);
            }
        }
        self.edges.remove(&conn);
        debug!("{} gone (peer {:?})", conn, state.node_id);
    }

    // ------------------------------------------------------------
    // Inbound payloads
    // ------------------------------------------------------------

    fn on_payload(&mut self, conn: ConnId, bytes: &[u8]) {
        let msgs = match Message::decode_all(bytes) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("bad payload on {}: {}", conn, e);
                self.disconnect(conn);
                return;
            }
        };

        for msg in msgs {
            // A handler may have closed the connection mid-batch.
            let Some(state) = self.connections.get(&conn) else {
                return;
            };
            let initialized = state.initialized();

            match msg {
                Message::Init(hs) => {
                    if initialized {
                        warn!("repeated init on {}", conn);
                        self.disconnect(conn);
                        return;
                    }
                    self.on_init(conn, hs);
                }
                msg if !initialized => {
                    warn!("{} message before init on {}", msg_name(&msg), conn);
                    self.disconnect(conn);
                    return;
                }
                Message::Keys(items) => self.on_keys(conn, items),
                Message::Query(keys) => self.on_query(conn, keys),
                Message::Nodes(items) => self.on_nodes(conn, items),
                Message::Fetch(items) => self.on_fetch(conn, items),
                Message::Data(items) => self.on_data(conn, items),
            }
        }
    }

    fn on_init(&mut self, conn: ConnId, hs: Handshake) {
        if hs.version != PROTOCOL_VERSION {
            warn!(
                "peer on {} speaks version {}, want {}",
                conn, hs.version, PROTOCOL_VERSION
            );
            self.disconnect(conn);
            return;
        }
        if hs.node_id == self.my_id {
            debug!("connected to ourselves on {}", conn);
            self.disconnect(conn);
            return;
        }

        // One link per peer: deterministically drop the newer connection.
        // Pending fetches on the loser move to the survivor.
        let mut inherited: Vec<(String, Uid)> = Vec::new();
        if let Some(&existing) = self.connected_nodes.get(&hs.node_id) {
            if conn > existing {
                debug!("duplicate link to {}; closing newer {}", hs.node_id, conn);
                let pending = self
                    .connections
                    .get_mut(&conn)
                    .map(|c| std::mem::take(&mut c.pending_fetch))
                    .unwrap_or_default();
                self.disconnect(conn);
                if !pending.is_empty() {
                    if let Some(survivor) = self.connections.get_mut(&existing) {
                        for (key, key_id) in pending {
                            survivor.fetch(key, key_id);
                        }
                    }
                    self.flush_fetches(existing);
                }
                return;
            }
            debug!(
                "duplicate link to {}; closing newer {}",
                hs.node_id, existing
            );
            inherited = self
                .connections
                .get_mut(&existing)
                .map(|c| std::mem::take(&mut c.pending_fetch))
                .unwrap_or_default();
            self.disconnect(existing);
        }

        let Some(state) = self.connections.get_mut(&conn) else {
            return;
        };
        state.version = hs.version;
        state.node_id = Some(hs.node_id);
        state.peer_node = Some(hs.node.clone());
        let is_fetch = state.is_fetch;
        for (key, key_id) in inherited {
            state.fetch(key, key_id);
        }

        self.connected_nodes.insert(hs.node_id, conn);
        if !is_fetch {
            self.edges.insert(conn);
        }
        info!("peer {} initialized on {}", hs.node_id, conn);

        // The handshake itself is a node advertisement.
        self.upsert_node(hs.node_id, &hs.node);

        // Fetch-only sockets skip the state exchange; they exist to carry
        // their queued fetches and nothing else.
        if !is_fetch {
            self.send_init_state(conn);
        }
        self.flush_fetches(conn);
    }

    fn on_keys(&mut self, conn: ConnId, items: Vec<KeyItem>) {
        let now = self.clock.now_ms();
        for item in items {
            // Our own advertisement reflected back.
            if self.data.get(&item.key).map_or(false, |d| d.id == item.id) {
                continue;
            }

            if item.ttl_ms == 0 {
                self.evict_key(&item.key, item.id);
                continue;
            }

            let is_new = {
                let set = self.keys.entry(item.key.clone()).or_default();
                match set.get_mut(&item.id) {
                    Some(existing) => {
                        existing.extend(item.ttl_ms as u64, now);
                        false
                    }
                    None => {
                        set.insert(item.id, Item::new(item.addrs.clone(), item.ttl_ms as u64, now));
                        true
                    }
                }
            };

            if is_new {
                debug!("learned {}/{} via {}", item.key, item.id, conn);
                let watched = self.watches.get(&item.key).map_or(false, |w| !w.is_empty());
                if watched && !self.fetch_inflight(&item.key, item.id) {
                    self.send_fetch(item.key.clone(), item.id, item.addrs.clone());
                }
            }
        }
    }

    fn on_query(&mut self, conn: ConnId, queried: Vec<String>) {
        let now = self.clock.now_ms();
        let mut reply = Vec::new();

        for key in queried {
            if let Some(d) = self.data.get(&key) {
                reply.push(KeyItem {
                    key: key.clone(),
                    id: d.id,
                    addrs: self.my_node.clone(),
                    ttl_ms: self.wire_ttl(),
                });
            }
            if let Some(set) = self.keys.get(&key) {
                for (id, item) in set {
                    let ttl = item.ttl_ms(now);
                    if ttl > 0 {
                        reply.push(KeyItem {
                            key: key.clone(),
                            id: *id,
                            addrs: item.addrs.clone(),
                            ttl_ms: ttl.min(u32::MAX as u64) as u32,
                        });
                    }
                }
            }
        }

        if !reply.is_empty() {
            self.send_one(conn, &Message::Keys(reply));
        }
    }

    fn on_nodes(&mut self, _conn: ConnId, items: Vec<NodeItem>) {
        for item in items {
            if item.id == self.my_id {
                continue;
            }
            let is_new = self.upsert_node_ttl(item.id, &item.addrs, item.ttl_ms as u64);

            // Fresh face and room in the mesh: link up straight away.
            if is_new
                && self.edges.len() < TARGET_EDGES
                && !self.connected_nodes.contains_key(&item.id)
            {
                self.connect_to(&item.addrs, false);
            }
        }
    }

    fn on_fetch(&mut self, conn: ConnId, items: Vec<FetchItem>) {
        let mut reply = Vec::new();
        for item in items {
            match self.data.get(&item.key) {
                Some(d) if d.id == item.id => reply.push(DataItem {
                    key: item.key,
                    id: item.id,
                    payload: d.payload.clone(),
                }),
                // Not ours (anymore); the peer retries elsewhere.
                _ => {}
            }
        }
        if !reply.is_empty() {
            self.send_one(conn, &Message::Data(reply));
        }
    }

    /// Fetched values are handed to watches and never cached; a watch
    /// registered later re-issues the fetch. Values may be large and the
    /// engine only keeps metadata.
    fn on_data(&mut self, conn: ConnId, items: Vec<DataItem>) {
        for item in items {
            debug!("data for {}/{} via {}", item.key, item.id, conn);
            self.drop_fetch(&item.key, item.id);
            self.notify_found(&item.key, item.id, item.payload);
        }
    }

    // ------------------------------------------------------------
    // Outbound gossip
    // ------------------------------------------------------------

    /// The post-handshake state dump: every key we know, every node we
    /// know (ourselves included), and a query for every key we watch.
    /// Composed as one multi-batch payload.
    fn send_init_state(&mut self, conn: ConnId) {
        let now = self.clock.now_ms();
        let mut msgs = Vec::new();

        let mut key_items: Vec<KeyItem> = self
            .data
            .iter()
            .map(|(key, d)| KeyItem {
                key: key.clone(),
                id: d.id,
                addrs: self.my_node.clone(),
                ttl_ms: self.wire_ttl(),
            })
            .collect();
        for (key, set) in &self.keys {
            for (id, item) in set {
                let ttl = item.ttl_ms(now);
                if ttl > 0 {
                    key_items.push(KeyItem {
                        key: key.clone(),
                        id: *id,
                        addrs: item.addrs.clone(),
                        ttl_ms: ttl.min(u32::MAX as u64) as u32,
                    });
                }
            }
        }
        if !key_items.is_empty() {
            msgs.push(Message::Keys(key_items));
        }

        let mut node_items = vec![NodeItem {
            id: self.my_id,
            addrs: self.my_node.clone(),
            ttl_ms: self.wire_ttl(),
        }];
        for (id, item) in &self.nodes {
            let ttl = item.ttl_ms(now);
            if ttl > 0 {
                node_items.push(NodeItem {
                    id: *id,
                    addrs: item.addrs.clone(),
                    ttl_ms: ttl.min(u32::MAX as u64) as u32,
                });
            }
        }
        msgs.push(Message::Nodes(node_items));

        let queries: Vec<String> = self.watches.keys().cloned().collect();
        if !queries.is_empty() {
            msgs.push(Message::Query(queries));
        }

        self.send_batch(conn, &msgs);
    }

    /// Drain a connection's queued fetches into a Fetch message, once the
    /// handshake is done.
    fn flush_fetches(&mut self, conn: ConnId) {
        let Some(state) = self.connections.get_mut(&conn) else {
            return;
        };
        if !state.initialized() || state.pending_fetch.is_empty() {
            return;
        }
        let items: Vec<FetchItem> = state
            .pending_fetch
            .drain(..)
            .map(|(key, id)| FetchItem { key, id })
            .collect();
        self.send_one(conn, &Message::Fetch(items));
    }

    fn send_fetch(&mut self, key: String, key_id: Uid, node: NodeAddress) {
        let now = self.clock.now_ms();
        self.issue_fetch(key, key_id, node, 1, now);
    }

    /// Route a fetch at a node, reusing an initialized connection to it if
    /// one exists, and (re)arm its retry record.
    fn issue_fetch(&mut self, key: String, key_id: Uid, node: NodeAddress, delay_ms: u64, now: u64) {
        let located = self
            .connections
            .values()
            .find(|c| c.initialized() && c.peer_node.as_ref() == Some(&node))
            .map(|c| c.conn);
        let conn = match located {
            Some(conn) => conn,
            None => self.connect_to(&node, true),
        };

        if let Some(state) = self.connections.get_mut(&conn) {
            state.fetch(key.clone(), key_id);
        }
        self.flush_fetches(conn);

        self.fetches
            .entry(key.clone())
            .or_default()
            .insert(key_id, Fetch { node, delay_ms });
        self.fetch_expiration.push_back(FetchExp {
            key,
            key_id,
            expiration: now + delay_ms,
        });
    }

    fn fetch_inflight(&self, key: &str, key_id: Uid) -> bool {
        self.fetches
            .get(key)
            .map_or(false, |m| m.contains_key(&key_id))
    }

    fn send_one(&self, conn: ConnId, msg: &Message) {
        self.send_batch(conn, std::slice::from_ref(msg));
    }

    fn send_batch(&self, conn: ConnId, msgs: &[Message]) {
        if msgs.is_empty() {
            return;
        }
        match Message::encode_batch(msgs) {
            Ok(frame) => self.endpoint.send(conn, frame),
            Err(e) => warn!("failed to encode outbound batch: {}", e),
        }
    }

    fn broadcast_to_edges(&self, msg: &Message) {
        if self.edges.is_empty() {
            return;
        }
        let frame = match Message::encode_batch(std::slice::from_ref(msg)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode broadcast: {}", e);
                return;
            }
        };
        for &conn in &self.edges {
            self.endpoint.send(conn, frame.clone());
        }
    }

    // ------------------------------------------------------------
    // Maintenance tick
    // ------------------------------------------------------------

    pub(crate) fn on_timer(&mut self) {
        let now = self.clock.now_ms();
        self.expire_connections(now);
        self.expire_keys(now);
        self.expire_nodes(now);
        self.expire_fetches(now);
        self.random_disconnect();
        self.random_connect();
        self.seed_connect();
        self.republish();
    }

    /// Reap connections that never finished their handshake.
    fn expire_connections(&mut self, now: u64) {
        while let Some(head) = self.conn_expiration.front() {
            if head.deadline > now {
                break;
            }
            let Some(exp) = self.conn_expiration.pop_front() else {
                break;
            };
            let still_opening = self
                .connections
                .get(&exp.conn)
                .map_or(false, |c| !c.initialized());
            if still_opening {
                debug!(
                    "{} failed to initialize within {}ms",
                    exp.conn, self.conn_exp_thresh_ms
                );
                self.disconnect(exp.conn);
            }
        }
    }

    fn expire_keys(&mut self, now: u64) {
        let mut lost: Vec<(String, Uid)> = Vec::new();
        self.keys.retain(|key, set| {
            set.retain(|id, item| {
                if item.expiration <= now {
                    lost.push((key.clone(), *id));
                    false
                } else {
                    true
                }
            });
            !set.is_empty()
        });

        for (key, key_id) in lost {
            debug!("{}/{} expired", key, key_id);
            // Any in-flight fetch dies with the advertisement; one loss
            // notification, not one per bookkeeping table.
            self.drop_fetch(&key, key_id);
            self.notify_lost(&key, key_id);
        }
    }

    fn expire_nodes(&mut self, now: u64) {
        self.nodes.retain(|id, item| {
            let keep = item.expiration > now;
            if !keep {
                debug!("node {} expired", id);
            }
            keep
        });
    }

    /// Drive the fetch retry timeline: reissue still-advertised fetches
    /// with doubled backoff, declare the rest lost.
    fn expire_fetches(&mut self, now: u64) {
        while let Some(head) = self.fetch_expiration.front() {
            if head.expiration > now {
                break;
            }
            let Some(exp) = self.fetch_expiration.pop_front() else {
                break;
            };

            // Answered or forgotten since this record was armed.
            let Some(fetch) = self
                .fetches
                .get(&exp.key)
                .and_then(|m| m.get(&exp.key_id))
                .cloned()
            else {
                continue;
            };

            let advertised = self
                .keys
                .get(&exp.key)
                .and_then(|set| set.get(&exp.key_id))
                .map(|item| item.addrs.clone());

            match advertised {
                Some(addrs) => {
                    let delay = (fetch.delay_ms * 2).min(MAX_FETCH_DELAY_MS);
                    debug!(
                        "refetching {}/{} (backoff {}ms)",
                        exp.key, exp.key_id, delay
                    );
                    self.issue_fetch(exp.key, exp.key_id, addrs, delay, now);
                }
                None => {
                    self.drop_fetch(&exp.key, exp.key_id);
                    self.notify_lost(&exp.key, exp.key_id);
                }
            }
        }
    }

    fn random_disconnect(&mut self) {
        if self.edges.is_empty() {
            return;
        }
        let over_target = self.edges.len() > TARGET_EDGES;
        if !over_target && !self.rng.gen_ratio(1, RANDOM_DISCONNECT_ODDS) {
            return;
        }
        let idx = self.rng.gen_range(0..self.edges.len());
        if let Some(&conn) = self.edges.iter().nth(idx) {
            debug!("random disconnect of {}", conn);
            self.disconnect(conn);
        }
    }

    fn random_connect(&mut self) {
        if self.edges.len() >= TARGET_EDGES || self.nodes.is_empty() {
            return;
        }
        let candidates: Vec<(Uid, NodeAddress)> = self
            .nodes
            .iter()
            .filter(|(id, _)| !self.connected_nodes.contains_key(id))
            .map(|(id, item)| (*id, item.addrs.clone()))
            .collect();
        if candidates.is_empty() {
            return;
        }
        let (id, addrs) = &candidates[self.rng.gen_range(0..candidates.len())];
        debug!("random connect to {}", id);
        self.connect_to(addrs, false);
    }

    /// Fall back to the seed list when the mesh is gone.
    fn seed_connect(&mut self) {
        if !self.edges.is_empty() {
            return;
        }
        let seeds = self.seeds.clone();
        for seed in seeds {
            self.connect_to(&NodeAddress::single(seed), false);
        }
    }

    /// Refresh our advertisements across the mesh.
    fn republish(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let items: Vec<KeyItem> = self
            .data
            .iter()
            .map(|(key, d)| KeyItem {
                key: key.clone(),
                id: d.id,
                addrs: self.my_node.clone(),
                ttl_ms: self.wire_ttl(),
            })
            .collect();
        self.broadcast_to_edges(&Message::Keys(items));
    }

    // ------------------------------------------------------------
    // Facade operations (executed on the engine task)
    // ------------------------------------------------------------

    fn discover(&mut self, key: String, handle: WatchHandle, watch: WatchFn) {
        info!("discover {:?} (watch {:?})", key, handle);
        self.watches
            .entry(key.clone())
            .or_default()
            .insert(handle, watch);

        // Nothing is cached, so "deliver what we already hold" means
        // fetching every advertisement we already hold.
        let known: Vec<(Uid, NodeAddress)> = self
            .keys
            .get(&key)
            .map(|set| {
                set.iter()
                    .map(|(id, item)| (*id, item.addrs.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (key_id, addrs) in known {
            if !self.fetch_inflight(&key, key_id) {
                self.send_fetch(key.clone(), key_id, addrs);
            }
        }

        self.broadcast_to_edges(&Message::Query(vec![key]));
    }

    fn forget(&mut self, key: &str, handle: WatchHandle) {
        let Some(watches) = self.watches.get_mut(key) else {
            return;
        };
        watches.remove(&handle);
        if watches.is_empty() {
            self.watches.remove(key);
            self.keys.remove(key);
            self.fetches.remove(key);
            debug!("forgot {:?}", key);
        }
    }

    /// A watch declared its payload invalid; refetch while the
    /// advertisement still stands.
    fn lost(&mut self, key: &str, key_id: Uid) {
        let Some(addrs) = self
            .keys
            .get(key)
            .and_then(|set| set.get(&key_id))
            .map(|item| item.addrs.clone())
        else {
            return;
        };
        if self.watches.contains_key(key) && !self.fetch_inflight(key, key_id) {
            self.send_fetch(key.to_string(), key_id, addrs);
        }
    }

    fn publish(&mut self, key: String, payload: Payload) {
        let d = Data::new(payload);
        info!("publish {:?} as {}", key, d.id);
        let item = KeyItem {
            key: key.clone(),
            id: d.id,
            addrs: self.my_node.clone(),
            ttl_ms: self.wire_ttl(),
        };
        self.data.insert(key, d);
        self.broadcast_to_edges(&Message::Keys(vec![item]));
    }

    fn retract(&mut self, key: &str) {
        let Some(d) = self.data.remove(key) else {
            return;
        };
        info!("retract {:?} ({})", key, d.id);
        self.broadcast_to_edges(&Message::Keys(vec![KeyItem {
            key: key.to_string(),
            id: d.id,
            addrs: self.my_node.clone(),
            ttl_ms: 0,
        }]));
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
            connections: self.connections.len(),
            keys: self.keys.values().map(|s| s.len()).sum(),
            watches: self.watches.values().map(|w| w.len()).sum(),
            data: self.data.len(),
            fetches: self.fetches.values().map(|m| m.len()).sum(),
        }
    }

    // ------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------

    fn upsert_node(&mut self, id: Uid, addrs: &NodeAddress) -> bool {
        let ttl = self.ttl_ms;
        self.upsert_node_ttl(id, addrs, ttl)
    }

    fn upsert_node_ttl(&mut self, id: Uid, addrs: &NodeAddress, ttl_ms: u64) -> bool {
        let now = self.clock.now_ms();
        match self.nodes.get_mut(&id) {
            Some(existing) => {
                existing.extend(ttl_ms, now);
                false
            }
            None => {
                debug!("learned node {} at {}", id, addrs);
                self.nodes
                    .insert(id, Item::new(addrs.clone(), ttl_ms, now));
                true
            }
        }
    }

    /// Remove a retracted or expired advertisement and tell the watches.
    fn evict_key(&mut self, key: &str, key_id: Uid) {
        let mut removed = false;
        let keys_emptied = self
            .keys
            .get_mut(key)
            .map(|set| {
                removed = set.remove(&key_id).is_some();
                set.is_empty()
            })
            .unwrap_or(false);
        if keys_emptied {
            self.keys.remove(key);
        }

        self.drop_fetch(key, key_id);

        if removed {
            debug!("{}/{} retracted", key, key_id);
            self.notify_lost(key, key_id);
        }
    }

    fn drop_fetch(&mut self, key: &str, key_id: Uid) {
        let emptied = self
            .fetches
            .get_mut(key)
            .map(|m| {
                m.remove(&key_id);
                m.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.fetches.remove(key);
        }
    }

    fn notify_found(&self, key: &str, key_id: Uid, payload: Payload) {
        let Some(watches) = self.watches.get(key) else {
            return;
        };
        for (handle, watch) in watches {
            invoke_watch(
                *handle,
                watch,
                WatchEvent::Found {
                    key: key.to_string(),
                    key_id,
                    payload: payload.clone(),
                },
            );
        }
    }

    fn notify_lost(&self, key: &str, key_id: Uid) {
        let Some(watches) = self.watches.get(key) else {
            return;
        };
        for (handle, watch) in watches {
            invoke_watch(
                *handle,
                watch,
                WatchEvent::Lost {
                    key: key.to_string(),
                    key_id,
                },
            );
        }
    }

    fn wire_ttl(&self) -> u32 {
        self.ttl_ms.min(u32::MAX as u64) as u32
    }

    // ------------------------------------------------------------
    // Test access
    // ------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    #[cfg(test)]
    pub(crate) fn known_nodes(&self) -> Vec<Uid> {
        self.nodes.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn known_keys(&self, key: &str) -> Vec<Uid> {
        self.keys
            .get(key)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn connected_peers(&self) -> Vec<Uid> {
        self.connected_nodes.keys().copied().collect()
    }
}

/// Watches never throw into the engine: a panicking callback is logged and
/// the engine continues.
fn invoke_watch(handle: WatchHandle, watch: &WatchFn, event: WatchEvent) {
    if catch_unwind(AssertUnwindSafe(|| watch(event))).is_err() {
        tracing::error!("watch {:?} panicked; continuing", handle);
    }
}

fn msg_name(msg: &Message) -> &'static str {
    match msg {
        Message::Init(_) => "init",
        Message::Keys(_) => "keys",
        Message::Query(_) => "query",
        Message::Nodes(_) => "nodes",
        Message::Fetch(_) => "fetch",
        Message::Data(_) => "data",
    }
}
