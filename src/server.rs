//! Listening Server
//!
//! Accepts TCP connections, wraps each in a [`Connection`], tracks the live
//! set, and periodically purges entries whose peer has gone away. Owner
//! notifications (connect, disconnect) are dispatched on their own spawned
//! tasks so they can never stall the accept loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::Result;

/// Owner-supplied callbacks for connection lifecycle events.
///
/// Both methods run on a fresh task per event. No ordering holds between
/// events of different connections, but a given connection's `on_disconnect`
/// is never dispatched before its `on_connect`: connections are registered
/// before the connect notification and only registered entries are purged.
pub trait ServerEventHandler: Send + Sync {
    fn on_connect(&self, connection: Arc<Connection>);
    fn on_disconnect(&self, connection: Arc<Connection>);
}

type SharedHandler = Arc<Mutex<Option<Arc<dyn ServerEventHandler>>>>;
type Registry = Arc<Mutex<Vec<Arc<Connection>>>>;

/// Listening server producing tracked [`Connection`]s.
///
/// Single start/stop cycle per instance: `start` binds and spawns the accept
/// task, `stop` signals it and waits for it to exit. Registered connections
/// survive `stop`; they belong to the owner.
pub struct LineServer {
    config: ServerConfig,
    local_addr: Option<SocketAddr>,
    connections: Registry,
    event_handler: SharedHandler,
    running: Arc<AtomicBool>,
    accepted_total: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
}

impl LineServer {
    /// Create a server for the configured address. No socket is bound until
    /// [`start`](LineServer::start).
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            local_addr: None,
            connections: Arc::new(Mutex::new(Vec::new())),
            event_handler: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            accepted_total: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            accept_task: None,
        }
    }

    /// Replace the owner's event handler; last write wins.
    pub async fn set_event_handler(&self, handler: Arc<dyn ServerEventHandler>) {
        *self.event_handler.lock().await = Some(handler);
    }

    /// Bind the listener and spawn the accept task.
    ///
    /// An invalid configuration or a bind failure is returned to the caller
    /// and leaves the server not-running.
    pub async fn start(&mut self) -> Result<()> {
        if self.accept_task.is_some() {
            bail!("server already started");
        }
        self.config
            .validate()
            .context("Invalid server configuration")?;

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read bound listener address")?;

        info!("Listening on {}", local_addr);
        self.local_addr = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        let connections = Arc::clone(&self.connections);
        let event_handler = Arc::clone(&self.event_handler);
        let running = Arc::clone(&self.running);
        let accepted_total = Arc::clone(&self.accepted_total);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let purge_interval = self.config.purge_interval;

        self.accept_task = Some(tokio::spawn(Self::accept_loop(
            listener,
            connections,
            event_handler,
            running,
            accepted_total,
            shutdown_rx,
            purge_interval,
        )));
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        connections: Registry,
        event_handler: SharedHandler,
        running: Arc<AtomicBool>,
        accepted_total: Arc<AtomicU64>,
        mut shutdown_rx: broadcast::Receiver<()>,
        purge_interval: u64,
    ) {
        loop {
            if !running.load(Ordering::SeqCst) {
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);

                        let accepted = accepted_total.fetch_add(1, Ordering::SeqCst) + 1;
                        if accepted % purge_interval == 0 {
                            Self::purge_disconnected(&connections, &event_handler).await;
                        }

                        let connection = Connection::new(stream);
                        connections.lock().await.push(Arc::clone(&connection));

                        let handler = event_handler.lock().await.clone();
                        if let Some(handler) = handler {
                            tokio::spawn(async move { handler.on_connect(connection) });
                        }
                    }
                    Err(error) => {
                        error!(%error, "Error accepting connection, stopping accept loop");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("Accept loop received shutdown signal");
                    break;
                }
            }
        }
        // The accept task owns the running flag after start, so a loop that
        // dies on an accept error is reported as not-running too.
        running.store(false, Ordering::SeqCst);
        info!("Accept loop stopped");
    }

    /// Remove registered connections whose peer is gone and dispatch a
    /// disconnect notification for each.
    ///
    /// The scan partitions a drained snapshot under the registry lock, so
    /// removal never mutates the collection mid-iteration. Best-effort: a
    /// connection that dies after the scan stays registered until the next
    /// pass.
    async fn purge_disconnected(connections: &Registry, event_handler: &SharedHandler) {
        let removed: Vec<Arc<Connection>> = {
            let mut registry = connections.lock().await;
            let mut kept = Vec::with_capacity(registry.len());
            let mut dead = Vec::new();
            for connection in registry.drain(..) {
                if connection.is_connected() {
                    kept.push(connection);
                } else {
                    dead.push(connection);
                }
            }
            *registry = kept;
            dead
        };

        if removed.is_empty() {
            return;
        }
        warn!("Purging {} disconnected connection(s)", removed.len());

        let handler = event_handler.lock().await.clone();
        if let Some(handler) = handler {
            for connection in removed {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.on_disconnect(connection) });
            }
        }
    }

    /// Signal the accept task and wait for it to exit. The accept task
    /// clears the running flag on its way out, before the join completes.
    ///
    /// Registered connections are neither closed nor purged; the owner keeps
    /// them.
    pub async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.accept_task.take() {
            match tokio::time::timeout(self.config.shutdown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) if join_error.is_cancelled() => {}
                Ok(Err(join_error)) => {
                    warn!(%join_error, "Accept task ended abnormally");
                }
                Err(_) => bail!(
                    "Accept task did not stop within {:?}",
                    self.config.shutdown_timeout
                ),
            }
        }

        info!("Server stopped");
        Ok(())
    }

    /// Address the listener is bound to, once started. With a port-0 bind
    /// this is the only way to learn the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connections accepted since `start`, including later-purged ones.
    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(Ordering::SeqCst)
    }

    /// Number of currently registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Snapshot of the currently registered connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.clone()
    }
}
