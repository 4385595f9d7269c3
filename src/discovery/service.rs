//! The public discovery facade.
//!
//! [`PeerDiscovery`] is a cheap handle; the state machine itself runs on a
//! dedicated engine task that exclusively owns every table. Facade calls
//! enqueue commands that the task drains in between network events and
//! maintenance ticks, so watch callbacks are free to call back into the
//! facade without deadlock or re-entrancy hazards.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::endpoint::{Endpoint, EndpointEvent};

use super::clock::Clock;
use super::engine::Engine;
use super::error::DiscoveryError;
use super::types::{
    DiscoveryConfig, NodeAddress, Payload, Stats, Uid, WatchEvent, WatchFn, WatchHandle,
};

/// Room left in a frame for the key, ids, and envelope around a payload.
const PAYLOAD_OVERHEAD_BYTES: usize = 1024;

/// Maximum publishable payload size.
pub const MAX_PAYLOAD_BYTES: usize =
    crate::endpoint::framing::MAX_FRAME_BYTES - PAYLOAD_OVERHEAD_BYTES;

/// Operations shipped from facade handles to the engine task.
pub enum Command {
    Discover {
        key: String,
        handle: WatchHandle,
        watch: WatchFn,
    },
    Forget {
        key: String,
        handle: WatchHandle,
    },
    Lost {
        key: String,
        key_id: Uid,
    },
    Publish {
        key: String,
        payload: Payload,
    },
    Retract {
        key: String,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
    Shutdown,
}

/// Handle to a running discovery node.
///
/// Clones share the node. The node stops when `shutdown` is called or every
/// handle is dropped.
#[derive(Clone)]
pub struct PeerDiscovery {
    my_id: Uid,
    my_node: NodeAddress,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PeerDiscovery {
    /// Bind the gossip endpoint and start the engine task.
    pub async fn bind(cfg: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let (endpoint, event_rx) = Endpoint::bind(cfg.bind).await?;
        let local = endpoint.local_addr();
        let advertised = cfg.advertise.unwrap_or(local);
        let my_node = NodeAddress::single(advertised);

        let engine = Engine::new(&cfg, my_node.clone(), endpoint.handle(), Clock::monotonic());
        let my_id = engine.id();
        info!("node {} listening on {}", my_id, local);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(engine, endpoint, cmd_rx, event_rx));

        Ok(Self {
            my_id,
            my_node,
            cmd_tx,
        })
    }

    /// This node's identity.
    pub fn id(&self) -> Uid {
        self.my_id
    }

    /// The addresses this node advertises.
    pub fn node(&self) -> &NodeAddress {
        &self.my_node
    }

    /// Register a watch on a key. The callback fires on the engine task
    /// with every value found behind the key and with losses as
    /// advertisements expire or are retracted.
    pub fn discover(
        &self,
        key: impl Into<String>,
        handle: WatchHandle,
        watch: impl Fn(WatchEvent) + Send + Sync + 'static,
    ) -> Result<(), DiscoveryError> {
        self.send(Command::Discover {
            key: key.into(),
            handle,
            watch: Arc::new(watch),
        })
    }

    /// Remove a watch. Dropping the last watch on a key drops the key's
    /// cached advertisements and in-flight fetches.
    pub fn forget(
        &self,
        key: impl Into<String>,
        handle: WatchHandle,
    ) -> Result<(), DiscoveryError> {
        self.send(Command::Forget {
            key: key.into(),
            handle,
        })
    }

    /// Signal that a previously delivered value is no longer usable; the
    /// engine refetches it while the advertisement stands.
    pub fn lost(&self, key: impl Into<String>, key_id: Uid) -> Result<(), DiscoveryError> {
        self.send(Command::Lost {
            key: key.into(),
            key_id,
        })
    }

    /// Publish a value under a key. Assigns a fresh id each call; one value
    /// per key.
    pub fn publish(
        &self,
        key: impl Into<String>,
        payload: Payload,
    ) -> Result<(), DiscoveryError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(DiscoveryError::PayloadTooLarge(payload.len()));
        }
        self.send(Command::Publish {
            key: key.into(),
            payload,
        })
    }

    /// Withdraw a published value; peers are told to evict it.
    pub fn retract(&self, key: impl Into<String>) -> Result<(), DiscoveryError> {
        self.send(Command::Retract { key: key.into() })
    }

    /// Snapshot of the engine's table sizes.
    pub async fn stats(&self) -> Result<Stats, DiscoveryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| DiscoveryError::Stopped)
    }

    /// Stop the engine and drop every connection.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) -> Result<(), DiscoveryError> {
        self.cmd_tx.send(cmd).map_err(|_| DiscoveryError::Stopped)
    }
}

/// The engine task: sole owner of the state machine. Drains commands and
/// endpoint events, and fires the randomized maintenance tick.
async fn run(
    mut engine: Engine,
    endpoint: Endpoint,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut event_rx: mpsc::UnboundedReceiver<EndpointEvent>,
) {
    engine.start();
    let mut next_tick =
        tokio::time::Instant::now() + Duration::from_millis(engine.next_period_ms());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown) | None => break,
                Some(cmd) => engine.handle_command(cmd),
            },
            ev = event_rx.recv() => match ev {
                Some(ev) => engine.handle_event(ev),
                None => break,
            },
            _ = tokio::time::sleep_until(next_tick) => {
                engine.on_timer();
                next_tick = tokio::time::Instant::now()
                    + Duration::from_millis(engine.next_period_ms());
            }
        }
    }

    endpoint.handle().shutdown();
    debug!("discovery engine {} stopped", engine.id());
}
