//! Glue between the transport, the per-address dispatch pipeline, and the
//! correlation engine. Both facades (server and client) embed this service.

use crate::config::RemotingConfig;
use crate::dispatch::DispatchQueue;
use crate::protocol::RemotingCommand;
use crate::remoting::{InvokeCallback, RemotingCore, RequestHandler, RpcHook};
use crate::transport::{Bootstrap, ByteHandler, ConnectionContext, ContextListener};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Feeds every byte chunk a read loop produces into the per-address
/// dispatch queue.
struct DispatchByteHandler {
    dispatch: Arc<DispatchQueue>,
}

#[async_trait]
impl ByteHandler for DispatchByteHandler {
    async fn handle(&self, ctx: &Arc<ConnectionContext>, chunk: Bytes) {
        self.dispatch.enqueue(ctx, chunk).await;
    }
}

/// Lifecycle proxy: keeps the dispatch-queue table in step with the
/// connection table, then forwards to the collaborator's listener.
struct InnerContextListener {
    dispatch: Arc<DispatchQueue>,
    user: Arc<RwLock<Option<Arc<dyn ContextListener>>>>,
}

impl ContextListener for InnerContextListener {
    fn on_connect(&self, ctx: &Arc<ConnectionContext>) {
        self.dispatch.ensure_queue(ctx.remote_addr());
        if let Some(listener) = self.user.read().clone() {
            listener.on_connect(ctx);
        }
    }

    fn on_close(&self, ctx: &Arc<ConnectionContext>) {
        self.dispatch.remove(ctx.remote_addr());
        if let Some(listener) = self.user.read().clone() {
            listener.on_close(ctx);
        }
    }

    fn on_error(&self, ctx: &Arc<ConnectionContext>) {
        self.dispatch.remove(ctx.remote_addr());
        if let Some(listener) = self.user.read().clone() {
            listener.on_error(ctx);
        }
    }

    fn on_idle(&self, ctx: &Arc<ConnectionContext>) {
        self.dispatch.remove(ctx.remote_addr());
        if let Some(listener) = self.user.read().clone() {
            listener.on_idle(ctx);
        }
    }
}

/// One wired remoting instance: bootstrap, dispatch pipeline, and
/// correlation engine, plus the collaborator-facing registration and
/// invocation APIs.
pub struct RemotingService {
    config: RemotingConfig,
    bootstrap: Arc<Bootstrap>,
    core: Arc<RemotingCore>,
    dispatch: Arc<DispatchQueue>,
    user_listener: Arc<RwLock<Option<Arc<dyn ContextListener>>>>,
    running: AtomicBool,
}

impl RemotingService {
    pub fn new(config: RemotingConfig) -> Result<Self> {
        config.validate()?;

        let bootstrap = Bootstrap::new(config.clone());
        let core = RemotingCore::new(Duration::from_millis(config.sweep_interval_ms));
        let dispatch = Arc::new(DispatchQueue::new(
            config.dispatch_queue_capacity,
            Some(config.framing),
            core.clone(),
        )?);
        let user_listener: Arc<RwLock<Option<Arc<dyn ContextListener>>>> =
            Arc::new(RwLock::new(None));

        bootstrap.register_handler(Arc::new(DispatchByteHandler {
            dispatch: dispatch.clone(),
        }));
        bootstrap.register_context_listener(Arc::new(InnerContextListener {
            dispatch: dispatch.clone(),
            user: user_listener.clone(),
        }));

        Ok(Self {
            config,
            bootstrap,
            core,
            dispatch,
            user_listener,
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    pub fn bootstrap(&self) -> &Arc<Bootstrap> {
        &self.bootstrap
    }

    pub fn core(&self) -> &Arc<RemotingCore> {
        &self.core
    }

    /// Start the timeout sweep and, when configured, the idle monitor.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.start_sweep();
        self.bootstrap.start_idle_monitor();
    }

    /// Stop sweeping, close every connection, and tear down every dispatch
    /// queue. Safe to call once; later calls are no-ops.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.shutdown();
        self.bootstrap.shutdown().await;
        self.dispatch.close();
    }

    pub fn register_handler(&self, code: i32, handler: Arc<dyn RequestHandler>) {
        self.core.register_handler(code, handler);
    }

    pub fn register_default_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.core.register_default_handler(handler);
    }

    pub fn register_hook(&self, hook: Arc<dyn RpcHook>) {
        self.core.register_hook(hook);
    }

    pub fn register_context_listener(&self, listener: Arc<dyn ContextListener>) {
        *self.user_listener.write() = Some(listener);
    }

    /// Invoke `request` on `addr` and wait for the matched response.
    pub async fn invoke_sync(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<RemotingCommand> {
        let ctx = self.bootstrap.connect(addr).await?;
        let timeout = Duration::from_millis(timeout_ms);

        let hook = self.core.hook();
        if let Some(hook) = &hook {
            hook.before_request(&ctx, &request);
        }
        let result = self.core.invoke_sync(&ctx, &request, timeout).await;
        if let Some(hook) = &hook {
            hook.after_response(&ctx, &request, result.as_ref().ok());
        }
        result
    }

    /// Invoke `request` on `addr`; `callback` fires exactly once with the
    /// outcome.
    pub async fn invoke_async(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
        callback: InvokeCallback,
    ) -> Result<()> {
        let ctx = self.bootstrap.connect(addr).await?;
        let timeout = Duration::from_millis(timeout_ms);

        if let Some(hook) = self.core.hook() {
            hook.before_request(&ctx, &request);
        }
        self.core.invoke_async(&ctx, &request, timeout, callback).await
    }

    /// Send `request` on `addr` without expecting a response.
    pub async fn invoke_oneway(
        &self,
        addr: &str,
        mut request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<()> {
        let ctx = self.bootstrap.connect(addr).await?;
        let timeout = Duration::from_millis(timeout_ms);
        request.mark_oneway();

        if let Some(hook) = self.core.hook() {
            hook.before_request(&ctx, &request);
        }
        self.core.invoke_oneway(&ctx, &request, timeout).await
    }
}
