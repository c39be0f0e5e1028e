//! Line-Oriented Connection
//!
//! Wraps one established TCP stream. A background task reads inbound lines
//! into an ordered queue; callers pull them with [`Connection::pop_message`]
//! or the blocking [`Connection::wait_for_message`] variants, and send with
//! [`Connection::write`]. Writes are serialized so concurrent callers never
//! interleave mid-line.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Result;

/// Process-wide connection ID source. IDs only carry identity, never
/// ordering semantics.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Errors surfaced by connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The operation was attempted after the connection transitioned to
    /// closed. `write` returns this rather than silently dropping the
    /// message.
    #[error("connection is closed")]
    Closed,

    /// A transport-level I/O failure. The connection is marked closed when
    /// this is returned from `write`.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Optional handlers invoked from inside the connection, replacing
/// subclass-style extension points.
///
/// `on_message_received` runs synchronously under the inbound queue lock, so
/// it observes lines in strict arrival order before any other consumer.
/// `on_socket_closed` fires exactly once per connection, whether closure was
/// requested explicitly or detected by the read task.
#[derive(Default)]
pub struct ConnectionHooks {
    on_message_received: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_socket_closed: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_message_received = Some(Box::new(hook));
        self
    }

    pub fn on_socket_closed<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_socket_closed = Some(Box::new(hook));
        self
    }
}

/// One live line-oriented TCP connection.
///
/// State machine is `OPEN -> CLOSED`, one way. The closed state is entered
/// by an explicit [`close`](Connection::close), by the peer ending the
/// stream, or by any I/O error during read; all paths converge on the same
/// state and the closed hook fires once.
pub struct Connection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    writer: Mutex<OwnedWriteHalf>,
    inbound: Mutex<VecDeque<String>>,
    closed: AtomicBool,
    closed_hook_fired: AtomicBool,
    hooks: ConnectionHooks,
    message_callback: Mutex<Option<MessageCallback>>,
    message_signal: Notify,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an established stream and start its read task.
    pub fn new(stream: TcpStream) -> Arc<Self> {
        Self::with_hooks(stream, ConnectionHooks::default())
    }

    /// Wrap an established stream with internal hooks installed.
    pub fn with_hooks(stream: TcpStream, hooks: ConnectionHooks) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            writer: Mutex::new(write_half),
            inbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            closed_hook_fired: AtomicBool::new(false),
            hooks,
            message_callback: Mutex::new(None),
            message_signal: Notify::new(),
            read_task: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::read_loop(
            Arc::clone(&connection),
            read_half,
        ));
        // The constructor holds the only reference, so the slot lock is
        // uncontended here.
        *connection
            .read_task
            .try_lock()
            .expect("read task slot is uncontended at construction") = Some(handle);

        debug!(id = connection.id, peer = ?connection.peer_addr, "connection opened");
        connection
    }

    /// Dial a remote listener and wrap the resulting stream.
    pub async fn connect(addr: SocketAddr) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Ok(Self::new(stream))
    }

    async fn read_loop(connection: Arc<Connection>, read_half: OwnedReadHalf) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if connection.is_closed() {
                        break;
                    }
                    {
                        let mut queue = connection.inbound.lock().await;
                        queue.push_back(line.clone());
                        if let Some(hook) = &connection.hooks.on_message_received {
                            hook(&line);
                        }
                    }
                    let callback = connection.message_callback.lock().await.clone();
                    if let Some(callback) = callback {
                        tokio::spawn(async move { callback(line) });
                    }
                    connection.message_signal.notify_waiters();
                }
                Ok(None) => {
                    debug!(id = connection.id, "peer closed the stream");
                    connection.transition_closed();
                    break;
                }
                Err(error) => {
                    debug!(id = connection.id, %error, "read failed, closing connection");
                    connection.transition_closed();
                    break;
                }
            }
        }
    }

    /// Mark the connection closed, fire the closed hook if it has not fired
    /// yet, and release any blocked waiters.
    fn transition_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.closed_hook_fired.swap(true, Ordering::SeqCst) {
            if let Some(hook) = &self.hooks.on_socket_closed {
                hook();
            }
        }
        self.message_signal.notify_waiters();
    }

    /// Send one line to the peer. Trailing whitespace is trimmed and a
    /// newline appended; the write is flushed before returning.
    ///
    /// Returns [`ConnectionError::Closed`] on a closed connection. An I/O
    /// failure marks the connection closed and is returned as
    /// [`ConnectionError::Io`]; failed writes are never retried.
    pub async fn write(&self, message: &str) -> std::result::Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut line = message.trim_end().to_owned();
        line.push('\n');

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(error) = result {
            warn!(id = self.id, %error, "write failed, closing connection");
            self.transition_closed();
            return Err(ConnectionError::Io(error));
        }
        Ok(())
    }

    /// Remove and return the oldest queued line without blocking.
    pub async fn pop_message(&self) -> Option<String> {
        self.inbound.lock().await.pop_front()
    }

    /// Block until a line is available or the connection closes with nothing
    /// pending. A line queued before the call returns immediately.
    pub async fn wait_for_message(&self) -> Option<String> {
        loop {
            let notified = self.message_signal.notified();
            tokio::pin!(notified);
            // Register before checking so a signal sent between the check
            // and the await is not lost.
            notified.as_mut().enable();

            if let Some(message) = self.inbound.lock().await.pop_front() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Like [`wait_for_message`](Connection::wait_for_message), but gives up
    /// after `timeout`. A zero timeout means "check once, do not block".
    pub async fn wait_for_message_timeout(&self, timeout: Duration) -> Option<String> {
        if timeout.is_zero() {
            return self.pop_message().await;
        }
        tokio::time::timeout(timeout, self.wait_for_message())
            .await
            .ok()
            .flatten()
    }

    /// Replace the owner's message callback. The callback runs on its own
    /// spawned task per received line; last write wins.
    pub async fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.message_callback.lock().await = Some(Arc::new(callback));
    }

    /// Stop reads, release the transport, and fire the closed hook if the
    /// read task has not already done so. Idempotent, safe to race with the
    /// read task detecting closure on its own.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let read_task = self.read_task.lock().await.take();
        if let Some(task) = read_task {
            task.abort();
            let _ = task.await;
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);

        self.transition_closed();
        debug!(id = self.id, "connection closed");
    }

    /// Whether the connection is still usable.
    ///
    /// Reflects the closed flag, which is also set opportunistically when a
    /// `write` observes a transport error. A connection whose peer has
    /// vanished reports disconnected as soon as either side of the stream
    /// surfaces the failure, not only after an explicit `close`.
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Process-unique identifier, used for equality and hashing.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address recorded when the stream was wrapped.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
