//! The correlation engine: pending-request table, invocation over a live
//! connection, and classification of inbound frames.

use crate::dispatch::FrameHandler;
use crate::protocol::{response_code, CommandType, RemotingCommand};
use crate::remoting::{InvokeCallback, RequestHandler, ResponseFuture, RpcHook};
use crate::transport::ConnectionContext;
use crate::{RemotingError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Grace added on top of a request's own timeout before the sweep expires it.
const SWEEP_MARGIN: Duration = Duration::from_secs(1);

/// Owns the pending-request and handler tables for one transport instance.
///
/// Inbound frames arrive through [`FrameHandler::on_frame`]; outbound
/// invocations go through `invoke_sync` / `invoke_async` / `invoke_oneway`
/// against an already-resolved [`ConnectionContext`]. The facades layer
/// address resolution and hook wrapping on top.
pub struct RemotingCore {
    me: Weak<RemotingCore>,
    pending: DashMap<i32, Arc<ResponseFuture>>,
    handlers: DashMap<i32, Arc<dyn RequestHandler>>,
    default_handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    hook: RwLock<Option<Arc<dyn RpcHook>>>,
    sweep_interval: Duration,
    running: AtomicBool,
    sweep_started: AtomicBool,
}

impl RemotingCore {
    pub fn new(sweep_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            default_handler: RwLock::new(None),
            hook: RwLock::new(None),
            sweep_interval,
            running: AtomicBool::new(true),
            sweep_started: AtomicBool::new(false),
        })
    }

    /// Register the handler for one command code; the last registration for
    /// a code wins.
    pub fn register_handler(&self, code: i32, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(code, handler);
    }

    /// Register the fallback handler for codes with no specific handler.
    pub fn register_default_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.default_handler.write() = Some(handler);
    }

    pub fn register_hook(&self, hook: Arc<dyn RpcHook>) {
        *self.hook.write() = Some(hook);
    }

    pub fn hook(&self) -> Option<Arc<dyn RpcHook>> {
        self.hook.read().clone()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and block until the matched response arrives or
    /// `timeout` elapses.
    pub async fn invoke_sync(
        &self,
        ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
        timeout: Duration,
    ) -> Result<RemotingCommand> {
        let timeout_ms = timeout.as_millis() as u64;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let future = Arc::new(ResponseFuture::new(request.opaque, timeout, None));
        future.set_completion(tx);
        self.pending.insert(request.opaque, future.clone());

        if let Err(e) = self.send_command(ctx, request, timeout).await {
            self.pending.remove(&request.opaque);
            error!("invoke_sync: send to {} failed: {}", ctx.remote_addr(), e);
            return Err(e);
        }
        future.mark_send_ok();

        match tokio::time::timeout(timeout, rx).await {
            // Completed: by the matching response, or early by the sweep.
            Ok(_) => future
                .take_response()
                .ok_or(RemotingError::Timeout { timeout_ms }),
            // Our own timer won; the entry is left for the sweep to remove.
            Err(_) => Err(RemotingError::Timeout { timeout_ms }),
        }
    }

    /// Send `request` and return once it is written; `callback` fires exactly
    /// once later, from the response-arrival path or the timeout sweep.
    pub async fn invoke_async(
        &self,
        ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
        timeout: Duration,
        callback: InvokeCallback,
    ) -> Result<()> {
        let future = Arc::new(ResponseFuture::new(request.opaque, timeout, Some(callback)));
        self.pending.insert(request.opaque, future.clone());

        if let Err(e) = self.send_command(ctx, request, timeout).await {
            // Reported to the caller instead; the callback never fires.
            self.pending.remove(&request.opaque);
            error!("invoke_async: send to {} failed: {}", ctx.remote_addr(), e);
            return Err(e);
        }
        future.mark_send_ok();
        Ok(())
    }

    /// Send `request` without registering a pending entry; no response is
    /// expected or matched. The caller marks the command oneway.
    pub async fn invoke_oneway(
        &self,
        ctx: &Arc<ConnectionContext>,
        request: &RemotingCommand,
        timeout: Duration,
    ) -> Result<()> {
        self.send_command(ctx, request, timeout).await
    }

    async fn send_command(
        &self,
        ctx: &Arc<ConnectionContext>,
        command: &RemotingCommand,
        timeout: Duration,
    ) -> Result<()> {
        let encoded = command.encode();
        match tokio::time::timeout(timeout, ctx.write(&encoded)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(RemotingError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Decode one reassembled frame and route it: requests to a registered
    /// handler, responses to their pending entry. Decode failures drop the
    /// frame; they are never fatal to the connection.
    pub async fn process_frame(&self, ctx: &Arc<ConnectionContext>, frame: Bytes) {
        let command = match RemotingCommand::decode(frame) {
            Ok(command) => command,
            Err(e) => {
                error!(
                    "dropping undecodable frame from {}: {}",
                    ctx.remote_addr(),
                    e
                );
                return;
            }
        };

        match command.command_type() {
            CommandType::Request => self.process_request(ctx, command).await,
            CommandType::Response => self.process_response(ctx, command),
        }
    }

    async fn process_request(&self, ctx: &Arc<ConnectionContext>, request: RemotingCommand) {
        let handler = self
            .handlers
            .get(&request.code)
            .map(|entry| entry.value().clone())
            .or_else(|| self.default_handler.read().clone());

        let Some(handler) = handler else {
            let remark = format!("request code {} not supported", request.code);
            error!("{} (from {})", remark, ctx.remote_addr());
            let mut response = RemotingCommand::create_response(
                response_code::REQUEST_CODE_NOT_SUPPORTED,
                Some(remark),
            );
            response.opaque = request.opaque;
            self.send_response(ctx, response).await;
            return;
        };

        let hook = self.hook.read().clone();
        if let Some(hook) = &hook {
            hook.before_request(ctx, &request);
        }
        let result = handler.process(ctx, &request).await;
        if let Some(hook) = &hook {
            let response = match &result {
                Ok(Some(response)) => Some(response),
                _ => None,
            };
            hook.after_response(ctx, &request, response);
        }

        match result {
            Err(e) => {
                error!(
                    "handler for code {} failed: {} (from {})",
                    request.code,
                    e,
                    ctx.remote_addr()
                );
                let mut response = RemotingCommand::create_response(
                    response_code::SYSTEM_ERROR,
                    Some(e.to_string()),
                );
                response.opaque = request.opaque;
                self.send_response(ctx, response).await;
            }
            // The sender expects nothing back.
            Ok(_) if request.is_oneway() => {}
            // The handler responded out-of-band, or has nothing to send.
            Ok(None) => {}
            Ok(Some(mut response)) => {
                response.opaque = request.opaque;
                response.mark_response();
                self.send_response(ctx, response).await;
            }
        }
    }

    fn process_response(&self, ctx: &Arc<ConnectionContext>, response: RemotingCommand) {
        // Removal from the table is the single-winner step: a duplicate or
        // late response finds nothing and is dropped.
        match self.pending.remove(&response.opaque) {
            Some((_, future)) => {
                future.set_response(response);
                future.complete();
            }
            None => warn!(
                "response from {} matched no pending request, opaque={}",
                ctx.remote_addr(),
                response.opaque
            ),
        }
    }

    async fn send_response(&self, ctx: &Arc<ConnectionContext>, response: RemotingCommand) {
        let encoded = response.encode();
        if let Err(e) = ctx.write(&encoded).await {
            error!("failed to send response to {}: {}", ctx.remote_addr(), e);
        }
    }

    /// Start the periodic timeout sweep. Idempotent.
    pub fn start_sweep(&self) {
        if self.sweep_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(core) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while core.running.load(Ordering::SeqCst) {
                tokio::time::sleep(core.sweep_interval).await;
                core.scan_timeouts();
            }
            debug!("timeout sweep exiting");
        });
    }

    /// Expire every pending request whose age exceeds its timeout plus a
    /// safety margin. Expired callbacks run on their own task so a slow
    /// callback never stalls the sweep.
    pub fn scan_timeouts(&self) {
        let expired: Vec<i32> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(SWEEP_MARGIN))
            .map(|entry| *entry.key())
            .collect();

        for opaque in expired {
            if let Some((_, future)) = self.pending.remove(&opaque) {
                warn!("removing timed out request, opaque={}", opaque);
                future.mark_timed_out();
                if future.has_callback() {
                    tokio::spawn(async move { future.complete() });
                } else {
                    future.complete();
                }
            }
        }
    }

    /// Stop the sweep; pending entries are abandoned and their callbacks are
    /// never invoked.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl FrameHandler for RemotingCore {
    async fn on_frame(&self, ctx: Arc<ConnectionContext>, frame: Bytes) {
        self.process_frame(&ctx, frame).await;
    }
}
