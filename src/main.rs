use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::{
    Json, Router,
    routing::{get, post},
};
use dashmap::DashMap;
use peermesh::discovery::{
    DiscoveryConfig, PeerDiscovery, WatchEvent, WatchHandle, DEFAULT_PORT,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;

/// Shared daemon state: the discovery handle plus the values observed so
/// far for every watched key.
struct AppState {
    discovery: PeerDiscovery,
    next_handle: AtomicU64,
    watched: DashMap<String, u64>,
    results: Arc<DashMap<String, DashMap<String, Vec<u8>>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut bind_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT));
    let mut advertise: Option<SocketAddr> = None;
    let mut seeds: Vec<SocketAddr> = vec![];
    let mut watch_keys: Vec<String> = vec![];
    let mut publishes: Vec<(String, String)> = vec![];

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = args[i + 1].parse()?;
                i += 2;
            }
            "--advertise" => {
                advertise = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seeds.push(args[i + 1].parse()?);
                i += 2;
            }
            "--watch" => {
                watch_keys.push(args[i + 1].clone());
                i += 2;
            }
            "--publish" => {
                let Some((key, value)) = args[i + 1].split_once('=') else {
                    anyhow::bail!("--publish expects key=value, got {:?}", args[i + 1]);
                };
                publishes.push((key.to_string(), value.to_string()));
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!(
                    "Usage: {} [--bind <addr:port>] [--advertise <addr:port>] \
                     [--seed <addr:port>]... [--watch <key>]... [--publish <key=value>]...",
                    args[0]
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument {:?}; see --help", other);
                std::process::exit(1);
            }
        }
    }

    let mut cfg = DiscoveryConfig::new(bind_addr).seeds(seeds.clone());
    if let Some(addr) = advertise {
        cfg = cfg.advertise(addr);
    }
    if let Some(ttl) = env_ms("PEERMESH_TTL_MS") {
        cfg = cfg.ttl(ttl);
    }
    if let Some(period) = env_ms("PEERMESH_PERIOD_MS") {
        cfg = cfg.period(period);
    }
    if let Some(thresh) = env_ms("PEERMESH_CONN_EXP_MS") {
        cfg = cfg.conn_exp_thresh(thresh);
    }

    tracing::info!("Starting node on {}", bind_addr);
    if !seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", seeds);
    } else {
        tracing::info!("Starting without seeds (founder)");
    }

    // 1. Discovery engine:
    let discovery = PeerDiscovery::bind(cfg).await?;
    tracing::info!("Node ID: {}", discovery.id());

    let state = Arc::new(AppState {
        discovery,
        next_handle: AtomicU64::new(1),
        watched: DashMap::new(),
        results: Arc::new(DashMap::new()),
    });

    // 2. Command-line watches and publishes:
    for key in &watch_keys {
        register_watch(&state, key)?;
    }
    for (key, value) in &publishes {
        state
            .discovery
            .publish(key.clone(), value.clone().into_bytes())?;
        tracing::info!("Published {:?}", key);
    }

    // 3. Periodic stats reporter:
    let stats_discovery = state.discovery.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            match stats_discovery.stats().await {
                Ok(stats) => {
                    let line = serde_json::to_string(&stats).unwrap_or_default();
                    tracing::info!("Cluster stats: {}", line);
                }
                Err(_) => return,
            }
        }
    });

    // 4. HTTP control surface:
    let app = Router::new()
        .route("/health/stats", get(handle_stats))
        .route("/publish", post(handle_publish))
        .route("/retract/:key", post(handle_retract))
        .route("/watch/:key", post(handle_watch))
        .route("/keys/:key", get(handle_keys))
        .layer(Extension(state.clone()));

    let gossip_port = state.discovery.node().0[0].port();
    let http_addr = SocketAddr::new(bind_addr.ip(), gossip_port + 1000);

    tracing::info!("HTTP control surface listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn env_ms(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Register a daemon-held watch on a key; results land in `state.results`
/// and are served by `GET /keys/:key`.
fn register_watch(state: &Arc<AppState>, key: &str) -> anyhow::Result<()> {
    if state.watched.contains_key(key) {
        return Ok(());
    }
    let handle = WatchHandle(state.next_handle.fetch_add(1, Ordering::Relaxed));
    state.watched.insert(key.to_string(), handle.0);

    let results = state.results.clone();
    state.discovery.discover(key, handle, move |ev| match ev {
        WatchEvent::Found {
            key,
            key_id,
            payload,
        } => {
            results
                .entry(key)
                .or_default()
                .insert(key_id.to_string(), payload);
        }
        WatchEvent::Lost { key, key_id } => {
            if let Some(values) = results.get(&key) {
                values.remove(&key_id.to_string());
            }
        }
    })?;

    tracing::info!("Watching {:?}", key);
    Ok(())
}

#[derive(Deserialize)]
struct PublishRequest {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct OpResponse {
    success: bool,
}

#[derive(Serialize)]
struct KeyValue {
    id: String,
    value: String,
}

#[derive(Serialize)]
struct KeyValuesResponse {
    key: String,
    values: Vec<KeyValue>,
}

#[derive(Serialize)]
struct NodeStatsResponse {
    node_id: String,
    addr: String,
    nodes: usize,
    edges: usize,
    connections: usize,
    keys: usize,
    watches: usize,
    data: usize,
    fetches: usize,
    cpu_usage: f32,
    mem_used_mb: u64,
    mem_total_mb: u64,
}

async fn handle_stats(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<NodeStatsResponse>, StatusCode> {
    let stats = state
        .discovery
        .stats()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    let mut sys = System::new_all();
    sys.refresh_cpu();
    sys.refresh_memory();
    let cpu_usage = sys.global_cpu_info().cpu_usage();
    // sysinfo returns bytes for memory values.
    let mem_total_mb = sys.total_memory() / (1024 * 1024);
    let mem_used_mb = sys.used_memory() / (1024 * 1024);

    Ok(Json(NodeStatsResponse {
        node_id: state.discovery.id().to_string(),
        addr: state.discovery.node().to_string(),
        nodes: stats.nodes,
        edges: stats.edges,
        connections: stats.connections,
        keys: stats.keys,
        watches: stats.watches,
        data: stats.data,
        fetches: stats.fetches,
        cpu_usage,
        mem_used_mb,
        mem_total_mb,
    }))
}

async fn handle_publish(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<PublishRequest>,
) -> (StatusCode, Json<OpResponse>) {
    match state
        .discovery
        .publish(req.key.clone(), req.value.into_bytes())
    {
        Ok(()) => (StatusCode::OK, Json(OpResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to publish {:?}: {}", req.key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpResponse { success: false }),
            )
        }
    }
}

async fn handle_retract(
    Extension(state): Extension<Arc<AppState>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<OpResponse>) {
    match state.discovery.retract(key.clone()) {
        Ok(()) => (StatusCode::OK, Json(OpResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to retract {:?}: {}", key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpResponse { success: false }),
            )
        }
    }
}

async fn handle_watch(
    Extension(state): Extension<Arc<AppState>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<OpResponse>) {
    match register_watch(&state, &key) {
        Ok(()) => (StatusCode::OK, Json(OpResponse { success: true })),
        Err(e) => {
            tracing::error!("Failed to watch {:?}: {}", key, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OpResponse { success: false }),
            )
        }
    }
}

async fn handle_keys(
    Extension(state): Extension<Arc<AppState>>,
    Path(key): Path<String>,
) -> (StatusCode, Json<KeyValuesResponse>) {
    let values = state
        .results
        .get(&key)
        .map(|values| {
            values
                .iter()
                .map(|entry| KeyValue {
                    id: entry.key().clone(),
                    value: String::from_utf8_lossy(entry.value()).into_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let status = if state.watched.contains_key(&key) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };

    (status, Json(KeyValuesResponse { key, values }))
}
