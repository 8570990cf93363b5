// src/lib.rs
pub mod config;
pub mod events;
pub mod files;
pub mod metrics;
pub mod net;
pub mod state;

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{anyhow, Context, Result};
use olaf_proto::Identity;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::events::{Ctx, Event};
use crate::files::FileStore;
use crate::net::NodeShared;
use crate::state::ServerState;

/// A running node. Dropping the handle does not stop it; call
/// [`NodeHandle::shutdown`].
pub struct NodeHandle {
    /// The socket actually bound (port resolved if 0 was configured).
    pub local_addr: SocketAddr,
    /// host:port this node tells the neighbourhood about.
    pub advertised: String,
    shutdown: broadcast::Sender<()>,
}

impl NodeHandle {
    /// Ask every task to exit and close its sockets.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Bring up a node: generate its identity, bind the listener, start the
/// event loop, the HTTP surface and the reconnect sweeper. Errors here are
/// fatal by definition.
pub async fn spawn(config: NodeConfig) -> Result<NodeHandle> {
    let identity = Identity::generate()
        .map_err(|e| anyhow!("could not generate server keypair: {e}"))?;

    let bind_addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {}:{}", config.host, config.port))?
        .next()
        .ok_or_else(|| anyhow!("{}:{} resolves to nothing", config.host, config.port))?;
    let listener = std::net::TcpListener::bind(bind_addr)
        .with_context(|| format!("cannot bind {bind_addr}"))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let advertised = config.advertised(local_addr.port());

    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shared = NodeShared { events: events_tx.clone(), shutdown: shutdown_tx.clone() };

    let store = FileStore::new(
        config.upload_dir.clone(),
        config.max_upload_bytes,
        advertised.clone(),
    )
    .with_context(|| format!("cannot prepare upload dir {}", config.upload_dir.display()))?;

    let server = axum::Server::from_tcp(listener)
        .context("listener handoff failed")?
        .serve(files::router(store, shared).into_make_service());
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        tracing::error!("http server died: {e}");
                    }
                }
                _ = shutdown_rx.recv() => debug!("http server shutting down"),
            }
        });
    }

    let state = ServerState::new(advertised.clone(), identity);
    let ctx = Ctx {
        events: events_tx.clone(),
        neighbourhood: config.neighbourhood.clone(),
        shutdown: shutdown_tx.clone(),
    };
    tokio::spawn(events::run(state, events_rx, ctx));
    net::spawn_sweeper(events_tx, shutdown_tx.subscribe(), config.sweep_interval);

    info!(%advertised, peers = config.neighbourhood.len(), "node up");
    Ok(NodeHandle { local_addr, advertised, shutdown: shutdown_tx })
}

/// Run until ctrl-c.
pub async fn run(config: NodeConfig) -> Result<()> {
    let handle = spawn(config).await?;
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    info!("shutdown signal received");
    handle.shutdown();
    Ok(())
}
