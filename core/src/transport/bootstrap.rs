//! Connection bootstrap: the listening socket, the table of live
//! connections, and the per-connection read loops.

use crate::config::RemotingConfig;
use crate::transport::context::ConnectionContext;
use crate::{RemotingError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use socket2::SockRef;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Backoff window for transient accept errors.
const ACCEPT_MIN_DELAY: Duration = Duration::from_millis(10);
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Receives raw byte chunks from a connection's read loop, in read order.
#[async_trait]
pub trait ByteHandler: Send + Sync {
    async fn handle(&self, ctx: &Arc<ConnectionContext>, chunk: Bytes);
}

/// Connection-lifecycle notifications.
///
/// Close, error, and idle fire at most once per connection, only for
/// connections that were actually registered in the table.
pub trait ContextListener: Send + Sync {
    fn on_connect(&self, ctx: &Arc<ConnectionContext>);
    fn on_close(&self, ctx: &Arc<ConnectionContext>);
    fn on_error(&self, ctx: &Arc<ConnectionContext>);
    fn on_idle(&self, ctx: &Arc<ConnectionContext>);
}

/// Owns the listener (server role) and the table of live connections, keyed
/// by remote-address string with at most one live entry per address.
pub struct Bootstrap {
    me: Weak<Bootstrap>,
    config: RwLock<RemotingConfig>,
    contexts: DashMap<String, Arc<ConnectionContext>>,
    handlers: RwLock<Vec<Arc<dyn ByteHandler>>>,
    context_listener: RwLock<Option<Arc<dyn ContextListener>>>,
    // Held across the check-then-insert sequence so concurrent dials to the
    // same address open exactly one socket.
    connect_lock: Mutex<()>,
    running: AtomicBool,
    idle_monitor_started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Bootstrap {
    pub fn new(config: RemotingConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config: RwLock::new(config),
            contexts: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            context_listener: RwLock::new(None),
            connect_lock: Mutex::new(()),
            running: AtomicBool::new(true),
            idle_monitor_started: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Register a byte handler; handlers run in registration order for every
    /// chunk a read loop produces.
    pub fn register_handler(&self, handler: Arc<dyn ByteHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn register_context_listener(&self, listener: Arc<dyn ContextListener>) {
        *self.context_listener.write() = Some(listener);
    }

    /// Effective configuration; the bind port is written back here when an
    /// ephemeral port was requested.
    pub fn config(&self) -> RemotingConfig {
        self.config.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the configured host/port and start accepting connections.
    ///
    /// Port 0 requests an ephemeral port; the resolved port is written back
    /// into the effective configuration. Returns the bound address.
    pub async fn bind(&self) -> Result<std::net::SocketAddr> {
        if !self.is_running() {
            return Err(RemotingError::Shutdown);
        }
        if self.handlers.read().is_empty() {
            warn!("no byte handler registered, received data will be dropped");
        }

        let (host, port) = {
            let config = self.config.read();
            (config.host.clone(), config.port)
        };
        let listener = TcpListener::bind((host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        if port == 0 {
            self.config.write().port = local_addr.port();
        }
        info!("listening for connections on {}", local_addr);

        self.start_idle_monitor();
        self.spawn_accept_loop(listener);
        Ok(local_addr)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let Some(bootstrap) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut shutdown_rx = bootstrap.shutdown_tx.subscribe();
            let mut delay = ACCEPT_MIN_DELAY;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            delay = ACCEPT_MIN_DELAY;
                            match bootstrap.register_connection(peer_addr.to_string(), stream) {
                                Ok(_) => debug!("accepted connection from {}", peer_addr),
                                Err(e) => error!(
                                    "failed to register connection from {}: {}",
                                    peer_addr, e
                                ),
                            }
                        }
                        Err(e) => {
                            if !bootstrap.is_running() {
                                break;
                            }
                            debug!("accept error ({}), sleeping {:?}", e, delay);
                            sleep(delay).await;
                            delay = (delay * 2).min(ACCEPT_MAX_DELAY);
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("accept loop exiting");
        });
    }

    /// Dial `addr` unless a live connection for it is already registered, in
    /// which case that connection is returned without opening a socket.
    pub async fn connect(&self, addr: &str) -> Result<Arc<ConnectionContext>> {
        if !self.is_running() {
            return Err(RemotingError::Shutdown);
        }
        if self.handlers.read().is_empty() {
            warn!("no byte handler registered, received data will be dropped");
        }

        if let Some(existing) = self.contexts.get(addr) {
            return Ok(existing.value().clone());
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(existing) = self.contexts.get(addr) {
            return Ok(existing.value().clone());
        }

        let connect_timeout = Duration::from_millis(self.config.read().connect_timeout_ms);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RemotingError::Connection(format!("connect to {} timed out", addr))
            })??;

        let ctx = self.register_connection(addr.to_string(), stream)?;
        info!("connected to {}", addr);
        Ok(ctx)
    }

    /// Wrap, register, and start serving one connected stream.
    fn register_connection(
        &self,
        key: String,
        stream: TcpStream,
    ) -> Result<Arc<ConnectionContext>> {
        self.configure_stream(&stream)?;
        let (ctx, read_half) = ConnectionContext::new(key.clone(), stream)?;
        self.contexts.insert(key, ctx.clone());
        self.spawn_read_loop(&ctx, read_half);

        if let Some(listener) = self.context_listener.read().clone() {
            let ctx = ctx.clone();
            tokio::spawn(async move { listener.on_connect(&ctx) });
        }
        Ok(ctx)
    }

    fn configure_stream(&self, stream: &TcpStream) -> Result<()> {
        let socket = SockRef::from(stream);
        socket.set_nodelay(true)?;
        if self.config.read().tcp_keepalive {
            socket.set_keepalive(true)?;
        }
        Ok(())
    }

    fn spawn_read_loop(&self, ctx: &Arc<ConnectionContext>, mut read_half: OwnedReadHalf) {
        let Some(bootstrap) = self.me.upgrade() else {
            return;
        };
        let ctx = ctx.clone();
        let buffer_size = self.config.read().read_buffer_size;
        tokio::spawn(async move {
            let mut buffer = vec![0u8; buffer_size];
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) => {
                        debug!("connection {} closed by peer", ctx.remote_addr());
                        bootstrap.on_context_close(&ctx).await;
                        break;
                    }
                    Ok(n) => {
                        ctx.touch();
                        // The read buffer is reused immediately; hand every
                        // handler an independently owned chunk.
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        let handlers = bootstrap.handlers.read().clone();
                        for handler in &handlers {
                            handler.handle(&ctx, chunk.clone()).await;
                        }
                    }
                    Err(e) => {
                        warn!("read failed on connection {}: {}", ctx.remote_addr(), e);
                        bootstrap.on_context_error(&ctx).await;
                        break;
                    }
                }
            }
            debug!("connection {} read loop exiting", ctx.remote_addr());
        });
    }

    /// Whether a live connection for `addr` is registered.
    pub fn has_connection(&self, addr: &str) -> bool {
        self.contexts
            .get(addr)
            .map_or(false, |ctx| !ctx.value().is_closed())
    }

    /// The registered connection for `addr`, if any.
    pub fn context(&self, addr: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.get(addr).map(|ctx| ctx.value().clone())
    }

    /// Every registered connection.
    pub fn contexts(&self) -> Vec<Arc<ConnectionContext>> {
        self.contexts
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.contexts.len()
    }

    /// Write raw bytes to the connection registered for `addr`.
    pub async fn write_to(&self, addr: &str, buf: &[u8]) -> Result<usize> {
        let ctx = self
            .context(addr)
            .ok_or_else(|| RemotingError::ConnectionNotFound(addr.to_string()))?;
        ctx.write(buf).await
    }

    /// Close the connection registered for `addr`; removal and the close
    /// notification follow from its read loop observing EOF.
    pub async fn disconnect(&self, addr: &str) {
        if let Some(ctx) = self.context(addr) {
            ctx.close().await;
        }
    }

    /// Stop accepting, close every live connection, and stop the idle scan.
    /// Safe to call once; subsequent calls and operations are no-ops.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let contexts: Vec<_> = self
            .contexts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.contexts.clear();
        for ctx in contexts {
            ctx.close().await;
        }
        info!("bootstrap shut down");
    }

    /// Start the periodic idle scan if an idle threshold is configured.
    /// Runs at half the threshold, or the threshold itself if that halves to
    /// zero. Idempotent.
    pub fn start_idle_monitor(&self) {
        let idle_secs = self.config.read().idle_timeout_secs;
        if idle_secs == 0 || self.idle_monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval_secs = if idle_secs / 2 == 0 { idle_secs } else { idle_secs / 2 };

        let Some(bootstrap) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut shutdown_rx = bootstrap.shutdown_tx.subscribe();
            let interval = Duration::from_secs(interval_secs);
            let threshold = Duration::from_secs(idle_secs);
            loop {
                tokio::select! {
                    _ = sleep(interval) => bootstrap.scan_idle(threshold).await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("idle monitor exiting");
        });
    }

    async fn scan_idle(&self, threshold: Duration) {
        let idle: Vec<_> = self
            .contexts
            .iter()
            .filter(|entry| entry.value().idle_duration() >= threshold)
            .map(|entry| entry.value().clone())
            .collect();

        for ctx in idle {
            // Removing first makes the idle callback the only notification
            // this connection gets; the read-loop exit finds no entry.
            if self.contexts.remove(ctx.remote_addr()).is_some() {
                warn!(
                    "evicting idle connection {}, idle for {:?}",
                    ctx.remote_addr(),
                    ctx.idle_duration()
                );
                if let Some(listener) = self.context_listener.read().clone() {
                    listener.on_idle(&ctx);
                }
                ctx.close().await;
            }
        }
    }

    async fn on_context_close(&self, ctx: &Arc<ConnectionContext>) {
        ctx.close().await;
        if self.contexts.remove(ctx.remote_addr()).is_some() {
            if let Some(listener) = self.context_listener.read().clone() {
                listener.on_close(ctx);
            }
        }
    }

    async fn on_context_error(&self, ctx: &Arc<ConnectionContext>) {
        ctx.close().await;
        if self.contexts.remove(ctx.remote_addr()).is_some() {
            if let Some(listener) = self.context_listener.read().clone() {
                listener.on_error(ctx);
            }
        }
    }
}
