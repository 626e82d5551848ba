//! The remoting client: core service plus server-address bookkeeping.

use crate::config::ClientConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tidemq::protocol::RemotingCommand;
use tidemq::remoting::{InvokeCallback, RemotingService, RequestHandler, RpcHook};
use tidemq::transport::ContextListener;
use tidemq::{RemotingError, Result};
use tracing::debug;

/// Client-side remoting endpoint.
///
/// Keeps a deduplicated, append-only list of known server addresses. An
/// invocation with an empty destination address resolves one through
/// [`choose_address`](Self::choose_address) immediately before connecting.
pub struct RemotingClient {
    service: RemotingService,
    server_addrs: RwLock<Vec<String>>,
    // Last address an invocation successfully chose; preferred while its
    // connection stays live.
    chosen_addr: RwLock<Option<String>>,
    addr_index: AtomicU32,
}

impl RemotingClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            service: RemotingService::new(config.remoting)?,
            server_addrs: RwLock::new(Vec::new()),
            chosen_addr: RwLock::new(None),
            addr_index: AtomicU32::new(0),
        })
    }

    /// Start the timeout sweep (and idle monitor, when configured).
    pub fn start(&self) {
        self.service.start();
    }

    /// Close every connection and stop the background tasks. Safe to call
    /// once; later calls are no-ops.
    pub async fn shutdown(&self) {
        self.service.shutdown().await;
    }

    /// Merge `addrs` into the known server list, skipping duplicates.
    pub fn update_server_addresses(&self, addrs: &[String]) {
        let mut known = self.server_addrs.write();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    /// The known server addresses.
    pub fn server_addresses(&self) -> Vec<String> {
        self.server_addrs.read().clone()
    }

    /// Pick a server address with a live connection.
    ///
    /// Prefers the last successfully used address while its connection is
    /// still live; otherwise advances a rotating index through the list,
    /// skipping addresses without a live connection. Returns `None` when no
    /// address has one.
    pub fn choose_address(&self) -> Option<String> {
        if let Some(chosen) = self.chosen_addr.read().clone() {
            if self.service.bootstrap().has_connection(&chosen) {
                return Some(chosen);
            }
        }

        let addrs = self.server_addrs.read();
        let len = addrs.len() as u32;
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let index = self.addr_index.fetch_add(1, Ordering::SeqCst).wrapping_add(1) % len;
            let candidate = addrs[index as usize].clone();
            *self.chosen_addr.write() = Some(candidate.clone());
            if self.service.bootstrap().has_connection(&candidate) {
                debug!("chose server address {}", candidate);
                return Some(candidate);
            }
        }
        None
    }

    fn resolve_address(&self, addr: &str) -> Result<String> {
        if addr.is_empty() {
            self.choose_address()
                .ok_or(RemotingError::NoAddressAvailable)
        } else {
            Ok(addr.to_string())
        }
    }

    /// Invoke `request` and wait for the matched response. An empty `addr`
    /// targets a chosen server.
    pub async fn invoke_sync(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<RemotingCommand> {
        let addr = self.resolve_address(addr)?;
        self.service.invoke_sync(&addr, request, timeout_ms).await
    }

    /// Invoke `request`; `callback` fires exactly once with the outcome. An
    /// empty `addr` targets a chosen server.
    pub async fn invoke_async(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
        callback: InvokeCallback,
    ) -> Result<()> {
        let addr = self.resolve_address(addr)?;
        self.service
            .invoke_async(&addr, request, timeout_ms, callback)
            .await
    }

    /// Send `request` without expecting a response. An empty `addr` targets
    /// a chosen server.
    pub async fn invoke_oneway(
        &self,
        addr: &str,
        request: RemotingCommand,
        timeout_ms: u64,
    ) -> Result<()> {
        let addr = self.resolve_address(addr)?;
        self.service.invoke_oneway(&addr, request, timeout_ms).await
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

    /// Whether a live connection to `addr` is registered.
    pub fn has_connection(&self, addr: &str) -> bool {
        self.service.bootstrap().has_connection(addr)
    }

    /// The underlying service, for direct access to the bootstrap and
    /// correlation engine.
    pub fn service(&self) -> &RemotingService {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RemotingClient {
        RemotingClient::new(ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn update_server_addresses_deduplicates() {
        let client = client();
        client.update_server_addresses(&[
            "10.0.0.1:10911".to_string(),
            "10.0.0.2:10911".to_string(),
        ]);
        client.update_server_addresses(&[
            "10.0.0.2:10911".to_string(),
            "10.0.0.3:10911".to_string(),
        ]);
        assert_eq!(
            client.server_addresses(),
            vec![
                "10.0.0.1:10911".to_string(),
                "10.0.0.2:10911".to_string(),
                "10.0.0.3:10911".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn choose_address_requires_a_live_connection() {
        let client = client();
        assert_eq!(client.choose_address(), None);

        client.update_server_addresses(&["10.0.0.1:10911".to_string()]);
        // Known but never connected: still nothing to choose.
        assert_eq!(client.choose_address(), None);
    }

    #[tokio::test]
    async fn empty_destination_without_live_servers_is_an_error() {
        let client = client();
        let request = RemotingCommand::create_request(1);
        let result = client.invoke_sync("", request, 1000).await;
        assert!(matches!(result, Err(RemotingError::NoAddressAvailable)));
    }
}
