//! Core types shared by every part of the session runtime
//!
//! Frames come in two shapes: [`CanFrame`] is what a transport exchanges on
//! the wire, [`Frame`] is the immutable, timestamped and directed record the
//! session builds around it once the frame has been seen on the bus.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Wall-clock timestamp type used when rendering monotonic frame times
pub type Timestamp = DateTime<Utc>;

/// Filename key identifying a loaded catalog inside one session (e.g. "powertrain.dbc")
pub type CatalogKey = String;

/// Largest 11-bit arbitration id
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit arbitration id
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Largest classic CAN payload
pub const MAX_CLASSIC_PAYLOAD: usize = 8;

/// Largest CAN-FD payload
pub const MAX_FD_PAYLOAD: usize = 64;

/// Identity of a CAN message: arbitration id plus the extended (29-bit) flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    /// Arbitration id without any flag bits
    pub id: u32,
    /// True for 29-bit identifiers
    pub extended: bool,
}

impl MessageKey {
    /// Standard (11-bit) message key
    pub fn standard(id: u32) -> Self {
        Self { id, extended: false }
    }

    /// Extended (29-bit) message key
    pub fn extended(id: u32) -> Self {
        Self { id, extended: true }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{:08X}x", self.id)
        } else {
            write!(f, "0x{:03X}", self.id)
        }
    }
}

/// Direction of a frame relative to the session's interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the bus
    Rx,
    /// Transmitted by this session
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "Rx"),
            Direction::Tx => write!(f, "Tx"),
        }
    }
}

/// Raw CAN frame as exchanged with a transport
///
/// Carries no timestamp or direction; the session stamps those when it wraps
/// the frame into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Classic frame with a standard identifier
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            can_id,
            is_extended: false,
            is_fd: false,
            data: data.into(),
        }
    }

    /// Classic frame with an extended identifier
    pub fn extended(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            can_id,
            is_extended: true,
            is_fd: false,
            data: data.into(),
        }
    }

    /// Builder method: mark the frame as CAN-FD
    pub fn with_fd(mut self, is_fd: bool) -> Self {
        self.is_fd = is_fd;
        self
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Message identity of this frame
    pub fn key(&self) -> MessageKey {
        MessageKey {
            id: self.can_id,
            extended: self.is_extended,
        }
    }

    /// Check identifier width and payload length
    pub fn validate(&self) -> Result<(), String> {
        let max_id = if self.is_extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.can_id > max_id {
            return Err(format!(
                "arbitration id 0x{:X} exceeds {}-bit range",
                self.can_id,
                if self.is_extended { 29 } else { 11 }
            ));
        }

        let max_len = if self.is_fd {
            MAX_FD_PAYLOAD
        } else {
            MAX_CLASSIC_PAYLOAD
        };
        if self.data.len() > max_len {
            return Err(format!(
                "payload of {} bytes exceeds {} byte limit",
                self.data.len(),
                max_len
            ));
        }
        Ok(())
    }
}

/// A frame seen on a session, immutable once created
///
/// Shared as `Arc<Frame>` between the trace buffer, the logging sink and
/// decode requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Microseconds since the session timebase was created (monotonic)
    pub timestamp_us: u64,
    /// Interface/channel label of the session that saw the frame
    pub channel: Arc<str>,
    /// Rx or Tx
    pub direction: Direction,
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// True if this is a CAN-FD frame
    pub is_fd: bool,
    /// Payload bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap a wire frame with a timestamp, channel label and direction
    pub fn from_can(
        timestamp_us: u64,
        channel: Arc<str>,
        direction: Direction,
        frame: CanFrame,
    ) -> Self {
        Self {
            timestamp_us,
            channel,
            direction,
            can_id: frame.can_id,
            is_extended: frame.is_extended,
            is_fd: frame.is_fd,
            data: frame.data,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Message identity of this frame
    pub fn key(&self) -> MessageKey {
        MessageKey {
            id: self.can_id,
            extended: self.is_extended,
        }
    }

    /// Timestamp in seconds (for display)
    pub fn timestamp_secs(&self) -> f64 {
        self.timestamp_us as f64 / 1_000_000.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:10.6}  {}  {}  {}  0x{:X}  DLC={} ",
            self.timestamp_secs(),
            self.channel,
            self.direction,
            if self.is_extended { "29" } else { "11" },
            self.can_id,
            self.dlc()
        )?;
        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Monotonic clock anchored to a wall-clock instant
///
/// Every session owns one timebase for its whole lifetime so that frame
/// timestamps keep increasing across stop/start cycles.
#[derive(Debug, Clone, Copy)]
pub struct Timebase {
    origin: Instant,
    wall_origin: Timestamp,
}

impl Timebase {
    /// Start a new timebase at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    /// Microseconds elapsed since the timebase was created
    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Instant corresponding to a timebase offset
    pub fn instant_at(&self, timestamp_us: u64) -> Instant {
        self.origin + std::time::Duration::from_micros(timestamp_us)
    }

    /// Convert a monotonic frame timestamp to wall-clock time
    pub fn to_wall_clock(&self, timestamp_us: u64) -> Timestamp {
        self.wall_origin + ChronoDuration::microseconds(timestamp_us as i64)
    }

    /// Wall-clock time at which the timebase was created
    pub fn wall_origin(&self) -> Timestamp {
        self.wall_origin
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Opened (or stopped) with no workers running
    Stopped,
    /// RX pipeline and TX scheduler are running
    Running,
    /// Terminal state, the session can no longer be used
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Stopped => write!(f, "STOPPED"),
            SessionState::Running => write!(f, "RUNNING"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Signal value types produced by decoding
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    /// Signed integer value
    Integer(i64),
    /// Floating-point value (after scaling/offset)
    Float(f64),
    /// Boolean value (single unscaled bit)
    Boolean(bool),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{:.3}", v),
            SignalValue::Boolean(v) => write!(f, "{}", if *v { "true" } else { "false" }),
        }
    }
}

impl SignalValue {
    /// Numeric value for plotting; booleans become 0/1
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Integer(v) => *v as f64,
            SignalValue::Float(v) => *v,
            SignalValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Convert signal value to i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SignalValue::Integer(v) => Some(*v),
            SignalValue::Float(v) => Some(*v as i64),
            SignalValue::Boolean(v) => Some(if *v { 1 } else { 0 }),
        }
    }

    /// Truthiness of the value
    pub fn as_bool(&self) -> bool {
        match self {
            SignalValue::Boolean(v) => *v,
            SignalValue::Integer(v) => *v != 0,
            SignalValue::Float(v) => *v != 0.0,
        }
    }
}

/// A decoded signal with its physical value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Signal name from the catalog
    pub name: String,
    /// Physical value derived from the raw bits (never clamped)
    pub value: SignalValue,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Raw value before scaling
    pub raw_value: i64,
    /// Declared physical minimum
    pub min: f64,
    /// Declared physical maximum
    pub max: f64,
}

impl DecodedSignal {
    /// Physical value clamped to the declared range, for presentation
    ///
    /// A `[0|0]` range means "unspecified" in DBC files and leaves the value
    /// untouched.
    pub fn clamped_value(&self) -> f64 {
        let value = self.value.as_f64();
        if (self.min == 0.0 && self.max == 0.0) || self.min > self.max {
            return value;
        }
        value.clamp(self.min, self.max)
    }
}

/// Result of decoding one frame against its owning catalog
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Catalog that decoded the frame
    pub catalog: CatalogKey,
    /// Message identity
    pub key: MessageKey,
    /// Message name from the catalog
    pub message_name: String,
    /// Sender node (if declared)
    pub sender: Option<String>,
    /// Decoded signals, in definition order
    pub signals: Vec<DecodedSignal>,
    /// Active multiplexer value (if the message is multiplexed)
    pub multiplexer_value: Option<u64>,
}

impl DecodedMessage {
    /// Look up a decoded signal by name
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Physical values keyed by signal name (input shape of `encode`)
    pub fn physical_values(&self) -> std::collections::HashMap<String, f64> {
        self.signals
            .iter()
            .map(|s| (s.name.clone(), s.value.as_f64()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_value_conversions() {
        let int_val = SignalValue::Integer(42);
        assert_eq!(int_val.as_f64(), 42.0);
        assert_eq!(int_val.as_i64(), Some(42));
        assert!(int_val.as_bool());

        let bool_val = SignalValue::Boolean(true);
        assert_eq!(bool_val.as_f64(), 1.0);
        assert!(bool_val.as_bool());
    }

    #[test]
    fn test_frame_validation() {
        assert!(CanFrame::new(0x7FF, vec![0; 8]).validate().is_ok());
        assert!(CanFrame::new(0x800, vec![0; 8]).validate().is_err());
        assert!(CanFrame::extended(0x1FFF_FFFF, vec![]).validate().is_ok());
        assert!(CanFrame::new(0x100, vec![0; 12]).validate().is_err());
        assert!(CanFrame::new(0x100, vec![0; 12]).with_fd(true).validate().is_ok());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::from_can(
            1_500_000,
            Arc::from("vcan0"),
            Direction::Rx,
            CanFrame::new(0x123, vec![0xDE, 0xAD]),
        );
        let line = frame.to_string();
        assert!(line.contains("1.500000"));
        assert!(line.contains("0x123"));
        assert!(line.ends_with("DE AD"));
    }

    #[test]
    fn test_clamped_value() {
        let signal = DecodedSignal {
            name: "Speed".to_string(),
            value: SignalValue::Float(300.0),
            unit: Some("km/h".to_string()),
            raw_value: 3000,
            min: 0.0,
            max: 250.0,
        };
        assert_eq!(signal.value.as_f64(), 300.0);
        assert_eq!(signal.clamped_value(), 250.0);
    }

    #[test]
    fn test_message_key_display() {
        assert_eq!(MessageKey::standard(0x100).to_string(), "0x100");
        assert_eq!(MessageKey::extended(0x18FF00).to_string(), "0x0018FF00x");
    }
}
