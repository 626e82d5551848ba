//! Per-remote-address dispatch: one bounded queue and one worker per peer,
//! decoupling the socket read loop from frame reassembly and handler
//! execution while preserving per-connection ordering.

use crate::config::FramingConfig;
use crate::protocol::FrameAssembler;
use crate::transport::ConnectionContext;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Receives complete frames (or raw chunks when framing is disabled) from a
/// dispatch worker, in arrival order for its address.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, ctx: Arc<ConnectionContext>, frame: Bytes);
}

type QueueSender = mpsc::Sender<(Arc<ConnectionContext>, Bytes)>;

/// Arena of per-address workers: a bounded queue plus one consumer task per
/// remote address, created lazily and torn down on connection removal.
pub struct DispatchQueue {
    capacity: usize,
    framing: Option<FramingConfig>,
    handler: Arc<dyn FrameHandler>,
    queues: DashMap<String, QueueSender>,
}

impl DispatchQueue {
    /// `framing: Some(..)` runs every chunk through that address's frame
    /// assembler before the handler sees it; `None` forwards raw chunks.
    pub fn new(
        capacity: usize,
        framing: Option<FramingConfig>,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self> {
        if let Some(framing) = &framing {
            framing.validate()?;
        }
        Ok(Self {
            capacity,
            framing,
            handler,
            queues: DashMap::new(),
        })
    }

    /// Create the queue and worker for `addr` if absent.
    pub fn ensure_queue(&self, addr: &str) {
        let _ = self.sender_for(addr);
    }

    /// Queue one chunk for `addr`'s worker. A full queue parks this call,
    /// applying backpressure to exactly one connection's read loop; other
    /// addresses are unaffected.
    pub async fn enqueue(&self, ctx: &Arc<ConnectionContext>, chunk: Bytes) {
        let sender = self.sender_for(ctx.remote_addr());
        if sender.send((ctx.clone(), chunk)).await.is_err() {
            debug!(
                "dispatch queue for {} is gone, dropping chunk",
                ctx.remote_addr()
            );
        }
    }

    /// Tear down the queue, worker, and assembler state for `addr`. The
    /// worker drains already-queued chunks, then exits.
    pub fn remove(&self, addr: &str) {
        if self.queues.remove(addr).is_some() {
            debug!("removed dispatch queue for {}", addr);
        }
    }

    /// Tear down every queue and worker.
    pub fn close(&self) {
        self.queues.clear();
    }

    /// Number of live per-address queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn sender_for(&self, addr: &str) -> QueueSender {
        if let Some(sender) = self.queues.get(addr) {
            return sender.value().clone();
        }
        match self.queues.entry(addr.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.capacity);
                entry.insert(tx.clone());
                self.spawn_worker(addr.to_string(), rx);
                tx
            }
        }
    }

    fn spawn_worker(&self, addr: String, mut rx: mpsc::Receiver<(Arc<ConnectionContext>, Bytes)>) {
        let handler = self.handler.clone();
        // Framing parameters were validated at construction.
        let mut assembler = self.framing.and_then(|cfg| FrameAssembler::new(cfg).ok());

        tokio::spawn(async move {
            while let Some((ctx, chunk)) = rx.recv().await {
                match assembler.as_mut() {
                    Some(assembler) => {
                        let mut frames = Vec::new();
                        if let Err(e) = assembler.pack(&chunk, |frame| frames.push(frame)) {
                            error!("frame reassembly failed for {}: {}", addr, e);
                        }
                        // Frames emitted before a reassembly error are still
                        // valid; deliver them in order.
                        for frame in frames {
                            handler.on_frame(ctx.clone(), frame).await;
                        }
                    }
                    None => handler.on_frame(ctx.clone(), chunk).await,
                }
            }
            debug!("dispatch worker for {} exiting", addr);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    struct Collector {
        frames: Mutex<Vec<Bytes>>,
        tx: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl FrameHandler for Collector {
        async fn on_frame(&self, _ctx: Arc<ConnectionContext>, frame: Bytes) {
            self.frames.lock().push(frame);
            let _ = self.tx.send(());
        }
    }

    async fn loopback_context() -> Arc<ConnectionContext> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server_side = listener.accept().await.unwrap();
        let (ctx, _read_half) = ConnectionContext::new(addr.to_string(), client).unwrap();
        ctx
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn reassembles_split_chunks_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collector {
            frames: Mutex::new(Vec::new()),
            tx,
        });
        let queue = DispatchQueue::new(
            16,
            Some(FramingConfig::default()),
            collector.clone() as Arc<dyn FrameHandler>,
        )
        .unwrap();

        let ctx = loopback_context().await;
        let mut stream = framed(b"first");
        stream.extend_from_slice(&framed(b"second"));

        // Split mid-frame across two enqueues.
        queue.enqueue(&ctx, Bytes::copy_from_slice(&stream[..7])).await;
        queue.enqueue(&ctx, Bytes::copy_from_slice(&stream[7..])).await;

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame not delivered")
                .unwrap();
        }
        let frames = collector.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
    }

    #[tokio::test]
    async fn raw_mode_forwards_chunks_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collector {
            frames: Mutex::new(Vec::new()),
            tx,
        });
        let queue =
            DispatchQueue::new(16, None, collector.clone() as Arc<dyn FrameHandler>).unwrap();

        let ctx = loopback_context().await;
        queue.enqueue(&ctx, Bytes::from_static(b"not a frame")).await;

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("chunk not delivered")
            .unwrap();
        assert_eq!(&collector.frames.lock()[0][..], b"not a frame");
    }

    #[tokio::test]
    async fn remove_tears_down_the_queue() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collector {
            frames: Mutex::new(Vec::new()),
            tx,
        });
        let queue =
            DispatchQueue::new(16, None, collector as Arc<dyn FrameHandler>).unwrap();

        queue.ensure_queue("10.0.0.1:9876");
        assert_eq!(queue.queue_count(), 1);
        queue.remove("10.0.0.1:9876");
        assert_eq!(queue.queue_count(), 0);
    }
}
