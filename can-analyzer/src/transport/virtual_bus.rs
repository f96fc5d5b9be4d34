//! In-process CAN bus
//!
//! Every transport opened on the same channel name is an endpoint of one
//! simulated bus. A frame sent by an endpoint reaches every other endpoint on
//! that channel; the sender does not receive its own frames.

use super::{Transport, TransportFactory, VIRTUAL_INTERFACE};
use crate::config::InterfaceConfig;
use crate::error::TransportError;
use crate::shared::lock;
use crate::types::CanFrame;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Endpoint {
    id: u64,
    inbox: Sender<CanFrame>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    channels: HashMap<String, Vec<Endpoint>>,
    /// Channels whose endpoints currently refuse to send
    busy: HashSet<String>,
    next_id: u64,
}

impl BusInner {
    /// Deliver to every endpoint of `channel` except `from`
    fn deliver(&self, channel: &str, from: Option<u64>, frame: &CanFrame) -> usize {
        self.channels.get(channel).map_or(0, |endpoints| {
            endpoints
                .iter()
                .filter(|e| Some(e.id) != from)
                .filter(|e| e.inbox.send(frame.clone()).is_ok())
                .count()
        })
    }
}

/// Shared in-process bus; clones refer to the same bus
#[derive(Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusInner>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an endpoint on `channel`
    pub fn connect(&self, channel: &str) -> VirtualTransport {
        let (inbox, rx) = unbounded();
        let connected = Arc::new(AtomicBool::new(true));

        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Endpoint {
                id,
                inbox,
                connected: Arc::clone(&connected),
            });
        log::debug!("Virtual endpoint #{} connected to '{}'", id, channel);

        VirtualTransport {
            id,
            channel: channel.to_string(),
            bus: self.clone(),
            rx,
            connected,
        }
    }

    /// Put a frame on `channel` as if an external node had sent it
    ///
    /// Returns the number of endpoints that received it.
    pub fn inject(&self, channel: &str, frame: CanFrame) -> usize {
        lock(&self.inner).deliver(channel, None, &frame)
    }

    /// Simulate unplugging every endpoint of `channel`
    pub fn disconnect_channel(&self, channel: &str) -> usize {
        let endpoints = lock(&self.inner).channels.remove(channel).unwrap_or_default();
        for endpoint in &endpoints {
            endpoint.connected.store(false, Ordering::SeqCst);
        }
        log::debug!(
            "Disconnected {} virtual endpoints from '{}'",
            endpoints.len(),
            channel
        );
        endpoints.len()
    }

    /// Make sends on `channel` fail with `Busy`
    pub fn set_busy(&self, channel: &str, busy: bool) {
        let mut inner = lock(&self.inner);
        if busy {
            inner.busy.insert(channel.to_string());
        } else {
            inner.busy.remove(channel);
        }
    }

    /// Number of open endpoints on `channel`
    pub fn endpoint_count(&self, channel: &str) -> usize {
        lock(&self.inner).channels.get(channel).map_or(0, Vec::len)
    }

    fn remove_endpoint(&self, channel: &str, id: u64) {
        let mut inner = lock(&self.inner);
        if let Some(endpoints) = inner.channels.get_mut(channel) {
            endpoints.retain(|e| e.id != id);
            if endpoints.is_empty() {
                inner.channels.remove(channel);
            }
        }
    }
}

impl TransportFactory for VirtualBus {
    fn open(&self, config: &InterfaceConfig) -> Result<Box<dyn Transport>, TransportError> {
        if config.interface != VIRTUAL_INTERFACE {
            return Err(TransportError::Unsupported(config.interface.clone()));
        }
        Ok(Box::new(self.connect(&config.channel)))
    }
}

/// One endpoint of a [`VirtualBus`]
pub struct VirtualTransport {
    id: u64,
    channel: String,
    bus: VirtualBus,
    rx: Receiver<CanFrame>,
    connected: Arc<AtomicBool>,
}

impl VirtualTransport {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected(self.channel.clone()))
        }
    }
}

impl Transport for VirtualTransport {
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        self.ensure_connected()?;
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => self.ensure_connected().map(|()| None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TransportError::Disconnected(self.channel.clone()))
            }
        }
    }

    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        self.ensure_connected()?;
        frame.validate().map_err(TransportError::Io)?;

        let inner = lock(&self.bus.inner);
        if inner.busy.contains(&self.channel) {
            return Err(TransportError::Busy(self.channel.clone()));
        }
        inner.deliver(&self.channel, Some(self.id), frame);
        Ok(())
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.bus.remove_endpoint(&self.channel, self.id);
            log::debug!("Virtual endpoint #{} closed", self.id);
        }
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(50);

    #[test]
    fn test_no_self_reception() {
        let bus = VirtualBus::new();
        let a = bus.connect("vcan0");
        let b = bus.connect("vcan0");
        let other = bus.connect("vcan1");

        a.send(&CanFrame::new(0x123, vec![1, 2, 3])).unwrap();

        assert_eq!(b.recv(POLL).unwrap().unwrap().can_id, 0x123);
        assert!(a.recv(Duration::from_millis(5)).unwrap().is_none());
        assert!(other.recv(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_inject_reaches_every_endpoint() {
        let bus = VirtualBus::new();
        let a = bus.connect("vcan0");
        let b = bus.connect("vcan0");

        let delivered = bus.inject("vcan0", CanFrame::extended(0x18FF_0001, vec![0xAA]));
        assert_eq!(delivered, 2);
        assert!(a.recv(POLL).unwrap().unwrap().is_extended);
        assert!(b.recv(POLL).unwrap().unwrap().is_extended);
    }

    #[test]
    fn test_disconnect_and_close() {
        let bus = VirtualBus::new();
        let a = bus.connect("vcan0");
        let b = bus.connect("vcan0");

        b.close();
        assert_eq!(bus.endpoint_count("vcan0"), 1);
        assert!(matches!(b.recv(POLL), Err(TransportError::Disconnected(_))));

        assert_eq!(bus.disconnect_channel("vcan0"), 1);
        assert!(matches!(a.recv(POLL), Err(TransportError::Disconnected(_))));
        assert!(a.send(&CanFrame::new(0x1, vec![])).is_err());
    }

    #[test]
    fn test_busy_and_invalid_frames() {
        let bus = VirtualBus::new();
        let a = bus.connect("vcan0");

        bus.set_busy("vcan0", true);
        assert!(matches!(
            a.send(&CanFrame::new(0x1, vec![])),
            Err(TransportError::Busy(_))
        ));
        bus.set_busy("vcan0", false);
        assert!(a.send(&CanFrame::new(0x1, vec![])).is_ok());

        assert!(matches!(
            a.send(&CanFrame::new(0x800, vec![])),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_factory_rejects_other_interfaces() {
        let bus = VirtualBus::new();
        let result = bus.open(&InterfaceConfig::new("pcan", "PCAN_USBBUS1"));
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
        assert!(bus.open(&InterfaceConfig::virtual_channel("vcan0")).is_ok());
    }
}
