//! Server facade: a remoting service that also owns a listening socket.

use crate::config::RemotingConfig;
use crate::protocol::RemotingCommand;
use crate::remoting::{InvokeCallback, RemotingService, RequestHandler, RpcHook};
use crate::transport::ContextListener;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;

/// The broker-side remoting endpoint: accepts connections, dispatches
/// inbound requests to registered handlers, and can itself invoke commands
/// on connected peers.
pub struct RemotingServer {
    service: RemotingService,
}

impl RemotingServer {
    pub fn new(config: RemotingConfig) -> Result<Self> {
        Ok(Self {
            service: RemotingService::new(config)?,
        })
    }

    /// Bind the configured host/port, start accepting, and start the
    /// timeout sweep and idle monitor. Returns the bound address (with the
    /// resolved port when port 0 was configured).
    pub async fn start(&self) -> Result<SocketAddr> {
        self.service.start();
        self.service.bootstrap().bind().await
    }

    /// Stop accepting, close every connection, and stop the background
    /// tasks. Safe to call once; later calls are no-ops.
    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }

    pub fn register_handler(&self, code: i32, handler: Arc<dyn RequestHandler>) {
        self.service.register_handler(code, handler);
    }

    pub fn register_default_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.service.register_default_handler(handler);
    }

    pub fn register_hook(&self, hook: Arc<dyn RpcHook>) {
        self.service.register_hook(hook);
    }

    pub fn register_context_listener(&self, listener: Arc<dyn ContextListener>) {
        self.service.register_context_listener(listener);
    }

    pub async fn invoke_sync(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<RemotingCommand> {
        self.service.invoke_sync(addr, request, timeout_ms).await
    }

    pub async fn invoke_async(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
        callback: InvokeCallback,
    ) -> Result<()> {
        self.service
            .invoke_async(addr, request, timeout_ms, callback)
            .await
    }

    pub async fn invoke_oneway(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<()> {
        self.service.invoke_oneway(addr, request, timeout_ms).await
    }

    /// The underlying service, for direct access to the bootstrap and
    /// correlation engine.
    pub fn service(&self) -> &RemotingService {
        &self.service
    }
}
