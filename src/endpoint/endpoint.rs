//! Framed TCP endpoint.
//!
//! Owns the listen socket and every connection. The engine talks to the
//! endpoint through an [`EndpointHandle`] (commands in) and an event channel
//! (lifecycle and payloads out); it never touches a socket directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::framing;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque connection token. Allocated from a monotonic counter and never
/// reused, unlike the OS file descriptors underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events the endpoint delivers to its owner.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A connection is established. `outbound` is true when this side
    /// initiated it.
    Opened {
        conn: ConnId,
        peer: Option<SocketAddr>,
        outbound: bool,
    },
    /// The connection is gone: peer close, I/O error, or failed connect.
    Closed { conn: ConnId },
    /// A whole payload arrived.
    Payload { conn: ConnId, bytes: Vec<u8> },
    /// A payload could not be delivered because the connection is gone.
    Dropped { conn: ConnId },
}

/// Commands accepted by the endpoint.
#[derive(Debug)]
pub enum EndpointCmd {
    /// Open an outbound connection, trying each address in order.
    Connect {
        conn: ConnId,
        addrs: Vec<SocketAddr>,
    },
    /// Queue a payload on a connection.
    Send { conn: ConnId, frame: Vec<u8> },
    /// Drop a connection. No `Closed` event is emitted for it.
    Close { conn: ConnId },
    /// Stop the listener and drop every connection.
    Shutdown,
}

/// Cheap, cloneable handle for issuing endpoint commands.
///
/// `connect` allocates the [`ConnId`] synchronously so the caller can track
/// the connection (and queue sends on it) before the TCP handshake finishes.
#[derive(Clone)]
pub struct EndpointHandle {
    cmd_tx: mpsc::UnboundedSender<EndpointCmd>,
    next_id: Arc<AtomicU64>,
}

impl EndpointHandle {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<EndpointCmd>, next_id: Arc<AtomicU64>) -> Self {
        Self { cmd_tx, next_id }
    }

    fn alloc(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Start an outbound connection and return its token immediately.
    /// Payloads sent before the socket is up are buffered; if every address
    /// fails, a `Closed` event is emitted for the token.
    pub fn connect(&self, addrs: Vec<SocketAddr>) -> ConnId {
        let conn = self.alloc();
        let _ = self.cmd_tx.send(EndpointCmd::Connect { conn, addrs });
        conn
    }

    /// Queue a payload. Whole-payload delivery or a `Dropped` event.
    pub fn send(&self, conn: ConnId, frame: Vec<u8>) {
        let _ = self.cmd_tx.send(EndpointCmd::Send { conn, frame });
    }

    /// Drop a connection.
    pub fn close(&self, conn: ConnId) {
        let _ = self.cmd_tx.send(EndpointCmd::Close { conn });
    }

    /// Stop the endpoint.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(EndpointCmd::Shutdown);
    }
}

type Registry = Arc<DashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>>;

/// A bound, running endpoint.
pub struct Endpoint {
    local_addr: SocketAddr,
    handle: EndpointHandle,
}

impl Endpoint {
    /// Bind the listen socket and start the accept and command loops.
    /// Returns the endpoint plus the event stream for its owner to drain.
    pub async fn bind(
        addr: SocketAddr,
    ) -> std::io::Result<(Endpoint, mpsc::UnboundedReceiver<EndpointEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry: Registry = Arc::new(DashMap::new());
        let next_id = Arc::new(AtomicU64::new(1));

        let handle = EndpointHandle::new(cmd_tx, next_id.clone());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            next_id,
            registry.clone(),
            event_tx.clone(),
        ));
        tokio::spawn(command_loop(cmd_rx, registry, event_tx, accept_task));

        Ok((Endpoint { local_addr, handle }, event_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    next_id: Arc<AtomicU64>,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = ConnId(next_id.fetch_add(1, Ordering::Relaxed));
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                registry.insert(conn, out_tx);

                debug!("accepted {} from {}", conn, peer);
                if event_tx
                    .send(EndpointEvent::Opened {
                        conn,
                        peer: Some(peer),
                        outbound: false,
                    })
                    .is_err()
                {
                    return;
                }
                spawn_connection(conn, stream, out_rx, registry.clone(), event_tx.clone());
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn command_loop(
    mut cmd_rx: mpsc::UnboundedReceiver<EndpointCmd>,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
    accept_task: JoinHandle<()>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            EndpointCmd::Connect { conn, addrs } => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                registry.insert(conn, out_tx);
                tokio::spawn(connect_task(
                    conn,
                    addrs,
                    out_rx,
                    registry.clone(),
                    event_tx.clone(),
                ));
            }
            EndpointCmd::Send { conn, frame } => {
                let delivered = match registry.get(&conn) {
                    Some(out_tx) => out_tx.send(frame).is_ok(),
                    None => false,
                };
                if !delivered {
                    let _ = event_tx.send(EndpointEvent::Dropped { conn });
                }
            }
            EndpointCmd::Close { conn } => {
                // Dropping the writer channel unwinds the connection tasks.
                registry.remove(&conn);
            }
            EndpointCmd::Shutdown => {
                accept_task.abort();
                registry.clear();
                return;
            }
        }
    }
    accept_task.abort();
    registry.clear();
}

async fn connect_task(
    conn: ConnId,
    addrs: Vec<SocketAddr>,
    out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
) {
    for addr in &addrs {
        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("connect {} to {} failed: {}", conn, addr, e);
                continue;
            }
            Err(_) => {
                debug!("connect {} to {} timed out", conn, addr);
                continue;
            }
        };

        // Closed while we were connecting; let the socket go.
        if !registry.contains_key(&conn) {
            return;
        }

        if event_tx
            .send(EndpointEvent::Opened {
                conn,
                peer: Some(*addr),
                outbound: true,
            })
            .is_err()
        {
            registry.remove(&conn);
            return;
        }
        spawn_connection(conn, stream, out_rx, registry, event_tx);
        return;
    }

    if registry.remove(&conn).is_some() {
        let _ = event_tx.send(EndpointEvent::Closed { conn });
    }
}

fn spawn_connection(
    conn: ConnId,
    stream: TcpStream,
    out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
) {
    let (rd, wr) = stream.into_split();
    let reader = tokio::spawn(read_loop(conn, rd, registry.clone(), event_tx.clone()));
    tokio::spawn(write_loop(conn, wr, out_rx, registry, event_tx, reader));
}

async fn read_loop(
    conn: ConnId,
    mut rd: OwnedReadHalf,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
) {
    loop {
        match framing::read_frame(&mut rd).await {
            Ok(Some(bytes)) => {
                if event_tx
                    .send(EndpointEvent::Payload { conn, bytes })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("read on {} failed: {}", conn, e);
                break;
            }
        }
    }

    if registry.remove(&conn).is_some() {
        let _ = event_tx.send(EndpointEvent::Closed { conn });
    }
}

/// Drains the outbound queue. Ends when the queue's sender is dropped,
/// which is how both peer-close (reader removed the registry entry) and an
/// explicit `Close` command reach us.
async fn write_loop(
    conn: ConnId,
    mut wr: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    registry: Registry,
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
    reader: JoinHandle<()>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = framing::write_frame(&mut wr, &frame).await {
            debug!("write on {} failed: {}", conn, e);
            break;
        }
    }

    let _ = wr.shutdown().await;
    if registry.remove(&conn).is_some() {
        let _ = event_tx.send(EndpointEvent::Closed { conn });
    }
    reader.abort();
}
