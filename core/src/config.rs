//! Configuration surface for the remoting transport.

use crate::{RemotingError, Result};
use serde::{Deserialize, Serialize};

/// Length-field framing parameters, shared by every assembler instance a
/// transport creates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Maximum accepted frame length in bytes; larger frames are treated as
    /// stream corruption and discarded.
    pub max_frame_length: usize,
    /// Byte offset of the length field within the frame header.
    pub length_field_offset: usize,
    /// Width of the length field in bytes; one of 1, 2, 4 or 8.
    pub length_field_width: usize,
    /// Leading bytes stripped from every emitted frame.
    pub initial_bytes_to_strip: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frame_length: 8 * 1024 * 1024, // 8 MiB
            length_field_offset: 0,
            length_field_width: 4,
            initial_bytes_to_strip: 4,
        }
    }
}

impl FramingConfig {
    /// Validate the framing parameters.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.length_field_width, 1 | 2 | 4 | 8) {
            return Err(RemotingError::UnsupportedLengthFieldWidth(
                self.length_field_width,
            ));
        }
        if self.max_frame_length == 0 {
            return Err(RemotingError::Config(
                "max_frame_length must be greater than 0".to_string(),
            ));
        }
        if self.initial_bytes_to_strip > self.length_field_offset + self.length_field_width {
            return Err(RemotingError::Config(format!(
                "initial_bytes_to_strip {} exceeds frame header length {}",
                self.initial_bytes_to_strip,
                self.length_field_offset + self.length_field_width
            )));
        }
        Ok(())
    }
}

/// Remoting transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotingConfig {
    /// Bind host for the server role.
    pub host: String,
    /// Bind port; 0 requests an ephemeral port, written back on bind.
    pub port: u16,
    /// Idle-eviction threshold in seconds; 0 disables the idle scan.
    pub idle_timeout_secs: u64,
    /// Enable SO_KEEPALIVE on accepted and dialed sockets.
    pub tcp_keepalive: bool,
    /// Read-loop buffer size in bytes.
    pub read_buffer_size: usize,
    /// Capacity of each per-address dispatch queue.
    pub dispatch_queue_capacity: usize,
    /// Dial timeout in milliseconds for outbound connects.
    pub connect_timeout_ms: u64,
    /// Interval of the pending-request timeout sweep in milliseconds.
    pub sweep_interval_ms: u64,
    /// Length-field framing parameters.
    pub framing: FramingConfig,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10911,
            idle_timeout_secs: 120,
            tcp_keepalive: false,
            read_buffer_size: 4096,
            dispatch_queue_capacity: 10000,
            connect_timeout_ms: 3000,
            sweep_interval_ms: 1000,
            framing: FramingConfig::default(),
        }
    }
}

impl RemotingConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(RemotingError::Config(
                "read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(RemotingError::Config(
                "dispatch_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(RemotingError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        self.framing.validate()
    }

    /// Load configuration from `TIDEMQ_*` environment variables, falling back
    /// to defaults for unset fields.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).map_err(cfg_err)?)
            .add_source(config::Environment::with_prefix("TIDEMQ").separator("__"))
            .build()
            .map_err(cfg_err)?;

        let cfg = settings.try_deserialize::<Self>().map_err(cfg_err)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn cfg_err(e: config::ConfigError) -> RemotingError {
    RemotingError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RemotingConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_length_field_width() {
        let framing = FramingConfig {
            length_field_width: 3,
            ..Default::default()
        };
        assert!(matches!(
            framing.validate(),
            Err(RemotingError::UnsupportedLengthFieldWidth(3))
        ));
    }

    #[test]
    fn rejects_strip_beyond_header() {
        let framing = FramingConfig {
            initial_bytes_to_strip: 5,
            ..Default::default()
        };
        assert!(framing.validate().is_err());
    }
}
