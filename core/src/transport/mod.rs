//! TCP transport: the per-socket connection context and the bootstrap that
//! owns the listener and the live-connection table.

pub mod bootstrap;
pub mod context;

pub use bootstrap::{Bootstrap, ByteHandler, ContextListener};
pub use context::ConnectionContext;
