//! Session configuration types
//!
//! Everything a session needs to know before it is opened: which interface
//! to attach to and how large its buffers are. Deserializable so the CLI can
//! read it straight out of a TOML file.

use crate::error::{AnalyzerError, Result};
use serde::{Deserialize, Serialize};

/// Physical (or virtual) interface a session attaches to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Driver name, e.g. "virtual", "socketcan", "pcan"
    pub interface: String,
    /// Channel on that driver, e.g. "vcan0" or "PCAN_USBBUS1"
    pub channel: String,
    /// Nominal bit rate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Enable CAN-FD
    #[serde(default)]
    pub fd: bool,
    /// CAN-FD data phase bit rate in bit/s
    #[serde(default = "default_data_bitrate")]
    pub data_bitrate: u32,
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_data_bitrate() -> u32 {
    2_000_000
}

impl InterfaceConfig {
    /// Create an interface description with default bit rates
    pub fn new(interface: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            channel: channel.into(),
            bitrate: default_bitrate(),
            fd: false,
            data_bitrate: default_data_bitrate(),
        }
    }

    /// Interface on the in-process virtual bus
    pub fn virtual_channel(channel: impl Into<String>) -> Self {
        Self::new(crate::transport::VIRTUAL_INTERFACE, channel)
    }

    /// Builder method: set the nominal bit rate
    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Builder method: enable CAN-FD with the given data bit rate
    pub fn with_fd(mut self, data_bitrate: u32) -> Self {
        self.fd = true;
        self.data_bitrate = data_bitrate;
        self
    }

    /// Human readable label, "interface:channel"
    pub fn label(&self) -> String {
        format!("{}:{}", self.interface, self.channel)
    }
}

/// Configuration for one CAN session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Display name, unique within a registry
    pub name: String,

    /// Interface to open when the session starts
    pub interface: InterfaceConfig,

    /// Maximum number of frames kept in the trace buffer
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,

    /// Maximum number of points kept per decoded signal series
    #[serde(default = "default_max_points")]
    pub max_points_per_series: usize,

    /// How long the RX worker waits on the transport before re-checking for stop
    #[serde(default = "default_rx_poll_ms")]
    pub rx_poll_ms: u64,

    /// Queue length of a sink attached with `attach_queued_sink`
    #[serde(default = "default_sink_queue_capacity")]
    pub sink_queue_capacity: usize,
}

fn default_trace_capacity() -> usize {
    100_000
}

fn default_max_points() -> usize {
    20_000
}

fn default_rx_poll_ms() -> u64 {
    10
}

fn default_sink_queue_capacity() -> usize {
    50_000
}

impl SessionConfig {
    /// Create a session configuration with default buffer sizes
    pub fn new(name: impl Into<String>, interface: InterfaceConfig) -> Self {
        Self {
            name: name.into(),
            interface,
            trace_capacity: default_trace_capacity(),
            max_points_per_series: default_max_points(),
            rx_poll_ms: default_rx_poll_ms(),
            sink_queue_capacity: default_sink_queue_capacity(),
        }
    }

    /// Builder method: set the trace buffer capacity
    pub fn with_trace_capacity(mut self, capacity: usize) -> Self {
        self.trace_capacity = capacity;
        self
    }

    /// Builder method: set the per-series point limit
    pub fn with_max_points_per_series(mut self, max_points: usize) -> Self {
        self.max_points_per_series = max_points;
        self
    }

    /// Builder method: set the RX poll interval
    pub fn with_rx_poll_ms(mut self, poll_ms: u64) -> Self {
        self.rx_poll_ms = poll_ms;
        self
    }

    /// Builder method: set the queued sink capacity
    pub fn with_sink_queue_capacity(mut self, capacity: usize) -> Self {
        self.sink_queue_capacity = capacity;
        self
    }

    /// Reject configurations the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AnalyzerError::InvalidConfig(
                "session name must not be empty".to_string(),
            ));
        }
        if self.trace_capacity == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "trace_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_points_per_series == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "max_points_per_series must be at least 1".to_string(),
            ));
        }
        if self.sink_queue_capacity == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "sink_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.rx_poll_ms == 0 {
            return Err(AnalyzerError::InvalidConfig(
                "rx_poll_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new("Powertrain", InterfaceConfig::virtual_channel("vcan0"))
            .with_trace_capacity(3)
            .with_max_points_per_series(10)
            .with_rx_poll_ms(5);

        assert_eq!(config.trace_capacity, 3);
        assert_eq!(config.max_points_per_series, 10);
        assert_eq!(config.rx_poll_ms, 5);
        assert_eq!(config.interface.label(), "virtual:vcan0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("A", InterfaceConfig::new("pcan", "PCAN_USBBUS1"));
        assert_eq!(config.trace_capacity, 100_000);
        assert_eq!(config.max_points_per_series, 20_000);
        assert_eq!(config.sink_queue_capacity, 50_000);
        assert_eq!(config.interface.bitrate, 500_000);
        assert!(!config.interface.fd);
    }

    #[test]
    fn test_invalid_config() {
        let config = SessionConfig::new("A", InterfaceConfig::virtual_channel("vcan0"))
            .with_trace_capacity(0);
        assert!(config.validate().is_err());

        let config = SessionConfig::new("  ", InterfaceConfig::virtual_channel("vcan0"));
        assert!(config.validate().is_err());
    }
}
