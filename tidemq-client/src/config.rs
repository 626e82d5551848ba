//! Client configuration.

use tidemq::RemotingConfig;

/// Configuration for a remoting client.
///
/// The client reuses the core transport configuration; the bind host/port
/// fields are ignored because a client never listens.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport, framing, and sweep parameters.
    pub remoting: RemotingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remoting: RemotingConfig {
                // Clients keep long-lived server connections; eviction is
                // the server's call.
                idle_timeout_secs: 0,
                ..RemotingConfig::default()
            },
        }
    }
}
