//! Transport abstraction
//!
//! A transport is one open CAN interface. The RX worker is its only reader
//! and the TX worker its only writer, both through a shared reference, so
//! implementations synchronize internally.

mod virtual_bus;

pub use virtual_bus::{VirtualBus, VirtualTransport};

use crate::config::InterfaceConfig;
use crate::error::TransportError;
use crate::types::CanFrame;
use std::time::Duration;

/// Interface name served by [`VirtualBus`]
pub const VIRTUAL_INTERFACE: &str = "virtual";

/// One open CAN interface
pub trait Transport: Send + Sync {
    /// Wait up to `timeout` for an inbound frame
    ///
    /// `Ok(None)` means the timeout elapsed; an error means the interface is
    /// gone and the session must stop.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;

    /// Put a frame on the bus
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Release the interface; later calls fail with `Disconnected`
    fn close(&self);
}

/// Opens transports for session configurations
pub trait TransportFactory: Send + Sync {
    fn open(&self, config: &InterfaceConfig) -> Result<Box<dyn Transport>, TransportError>;
}
