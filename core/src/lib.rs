//! # TideMQ Remoting Core
//!
//! TideMQ is a distributed message-queue platform (broker, producer/consumer
//! clients, directory service). This crate is its network transport and
//! RPC-correlation core: a length-prefixed binary wire protocol, a stream
//! de-framer tolerant of partial and coalesced TCP reads, a per-remote-address
//! ordered dispatch pipeline decoupled from socket I/O, and a
//! request/response correlation engine offering synchronous, asynchronous
//! callback, and oneway invocation with timeout enforcement and
//! connection-lifecycle notification.
//!
//! Everything above this layer — message storage, topic and consumer-group
//! management, offset tracking, administration — plugs in from the outside by
//! registering [`remoting::RequestHandler`]s for command codes, calling the
//! invocation API, and optionally implementing a
//! [`transport::ContextListener`].
//!
//! ## Architecture
//!
//! - [`protocol`] - `RemotingCommand` codec and the length-field frame assembler
//! - [`transport`] - connection context and bootstrap (accept/dial/lifecycle)
//! - [`dispatch`] - per-address bounded queue and worker
//! - [`remoting`] - pending-request table, invocation modes, handler dispatch
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidemq::remoting::{RemotingServer, RequestHandler};
//! use tidemq::protocol::{response_code, RemotingCommand};
//! use tidemq::transport::ConnectionContext;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl RequestHandler for Echo {
//!     async fn process(
//!         &self,
//!         _ctx: &Arc<ConnectionContext>,
//!         request: &RemotingCommand,
//!     ) -> tidemq::Result<Option<RemotingCommand>> {
//!         let mut response = RemotingCommand::create_response(response_code::SUCCESS, None);
//!         response.body = request.body.clone();
//!         Ok(Some(response))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> tidemq::Result<()> {
//!     let server = RemotingServer::new(tidemq::RemotingConfig::default())?;
//!     server.register_handler(100, Arc::new(Echo));
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod remoting;
pub mod transport;

pub use config::{FramingConfig, RemotingConfig};
pub use protocol::{CommandType, RemotingCommand};
pub use remoting::{
    InvokeCallback, RemotingCore, RemotingServer, RequestHandler, ResponseFuture, RpcHook,
};
pub use transport::{Bootstrap, ConnectionContext, ContextListener};

use thiserror::Error;

/// TideMQ remoting error types.
///
/// Every per-connection and per-frame failure is isolated to that connection
/// or frame; nothing in this crate is fatal to the process.
#[derive(Debug, Error)]
pub enum RemotingError {
    /// Socket-level read/write/listen failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial failures and writes on dead connections
    #[error("connection error: {0}")]
    Connection(String),

    /// A write was addressed to a remote with no live connection table entry
    #[error("no connection registered for {0}")]
    ConnectionNotFound(String),

    /// A frame (declared or received) exceeded the configured maximum
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Length-field widths outside {1, 2, 4, 8}
    #[error("unsupported length field width {0}")]
    UnsupportedLengthFieldWidth(usize),

    /// Malformed command bytes
    #[error("decode error: {0}")]
    Decode(String),

    /// Custom-header serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation and loading errors
    #[error("configuration error: {0}")]
    Config(String),

    /// A sync or async invocation exceeded its deadline
    #[error("invoke timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The client could not resolve an empty destination to a live server
    #[error("no server address available")]
    NoAddressAvailable,

    /// Operation attempted after shutdown
    #[error("remoting service is shut down")]
    Shutdown,
}

impl RemotingError {
    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is connection-related.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionNotFound(_) | Self::Io(_)
        )
    }
}

/// Result type alias used throughout the remoting core.
pub type Result<T> = std::result::Result<T, RemotingError>;
