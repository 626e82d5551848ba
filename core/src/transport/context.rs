//! Connection state for one live socket.

use crate::{RemotingError, Result};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// One live TCP connection.
///
/// The context owns the write half; the read half is consumed by the
/// bootstrap's read loop. Writes are funneled through an async mutex so each
/// command's bytes land contiguously on the wire; ordering between
/// concurrent writers remains the caller's responsibility.
#[derive(Debug)]
pub struct ConnectionContext {
    remote_addr: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    last_activity: RwLock<Instant>,
    closed: AtomicBool,
}

impl ConnectionContext {
    /// Wrap a connected stream; returns the context and the read half for
    /// the read loop. `remote_addr` is the connection-table key: the dialed
    /// address for outbound connections, the peer address for inbound ones.
    pub(crate) fn new(remote_addr: String, stream: TcpStream) -> Result<(Arc<Self>, OwnedReadHalf)> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let ctx = Arc::new(Self {
            remote_addr,
            local_addr,
            peer_addr,
            writer: Mutex::new(write_half),
            last_activity: RwLock::new(Instant::now()),
            closed: AtomicBool::new(false),
        });
        Ok((ctx, read_half))
    }

    /// The connection-table key for this context.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write the whole buffer to the peer, returning the number of bytes
    /// written.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(RemotingError::Connection(format!(
                "connection {} is closed",
                self.remote_addr
            )));
        }
        self.touch();
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        Ok(buf.len())
    }

    /// Time since the last read or write on this connection.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut down the write half; the peer (and our read loop) observe EOF.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }
}
