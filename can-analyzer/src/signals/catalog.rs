//! Catalog of one DBC file
//!
//! A [`DbcCatalog`] holds the Node→Message→Signal tree produced by the DBC
//! adapter. It is read-only once handed to the router.

use crate::signals::layout::SignalLayout;
use crate::types::MessageKey;
use std::collections::HashMap;
use std::path::PathBuf;

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN message identity
    pub key: MessageKey,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

impl MessageDefinition {
    /// Create an empty message definition
    pub fn new(key: MessageKey, name: impl Into<String>, size: usize) -> Self {
        Self {
            key,
            name: name.into(),
            size,
            sender: None,
            signals: Vec::new(),
            multiplexer_signal: None,
        }
    }

    /// Builder method: set the sending node
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    /// Builder method: declare the multiplexer (switch) signal
    pub fn with_multiplexer(mut self, signal_name: impl Into<String>) -> Self {
        self.multiplexer_signal = Some(signal_name.into());
        self
    }

    /// True if this message has multiplexed signals
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_signal.is_some()
            || self.signals.iter().any(|s| s.multiplexer_info.is_some())
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// The multiplexer signal definition, if any
    pub fn multiplexer(&self) -> Option<&SignalDefinition> {
        self.multiplexer_signal
            .as_deref()
            .and_then(|name| self.signal(name))
    }
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Physical start value used when a transmit request leaves the signal out
    pub default_value: Option<f64>,
    /// Receiving nodes
    pub receivers: Vec<String>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// Unsigned little-endian signal with unit scaling and no declared range
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            default_value: None,
            receivers: Vec::new(),
            multiplexer_info: None,
        }
    }

    /// Builder method: set factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set the physical range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Builder method: set the unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: set the physical default value
    pub fn with_default(mut self, value: f64) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Builder method: Motorola byte order
    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::BigEndian;
        self
    }

    /// Builder method: two's complement raw value
    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    /// Builder method: only present when the multiplexer equals `value`
    pub fn multiplexed_by(mut self, multiplexer: impl Into<String>, value: u64) -> Self {
        self.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: multiplexer.into(),
            multiplexer_values: vec![value],
        });
        self
    }

    /// Bit layout of this signal
    pub fn layout(&self) -> SignalLayout {
        SignalLayout::new(self.start_bit, self.length, self.byte_order)
    }

    /// DBC files use `[0|0]` for "no range declared"
    pub fn has_range(&self) -> bool {
        !(self.min == 0.0 && self.max == 0.0) && self.min <= self.max
    }

    /// Convert a raw value to its physical value
    pub fn to_physical(&self, raw: i64) -> f64 {
        self.offset + self.factor * (raw as f64)
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// A network node declared in the DBC file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefinition {
    /// Node (ECU) name
    pub name: String,
}

/// Node→Message→Signal tree of one DBC file
#[derive(Debug, Clone, Default)]
pub struct DbcCatalog {
    /// Source file, if the catalog was parsed from disk
    path: Option<PathBuf>,
    nodes: Vec<NodeDefinition>,
    messages: HashMap<MessageKey, MessageDefinition>,
    /// Message keys in definition order
    order: Vec<MessageKey>,
}

impl DbcCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: record the source file
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Builder method: add a message
    pub fn with_message(mut self, message: MessageDefinition) -> Self {
        self.add_message(message);
        self
    }

    /// Add a node; duplicates are ignored
    pub fn add_node(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.nodes.iter().any(|n| n.name == name) {
            self.nodes.push(NodeDefinition { name });
        }
    }

    /// Add a message definition; a second definition of the same key replaces the first
    pub fn add_message(&mut self, message: MessageDefinition) {
        let key = message.key;
        if self.messages.insert(key, message).is_some() {
            log::warn!("Message {} defined twice in catalog, keeping the last definition", key);
        } else {
            self.order.push(key);
        }
    }

    /// Source file of the catalog
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// All nodes, in declaration order
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    /// Get a message definition by identity
    pub fn message(&self, key: MessageKey) -> Option<&MessageDefinition> {
        self.messages.get(&key)
    }

    /// Get a message definition by name
    pub fn message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages().find(|m| m.name == name)
    }

    /// All messages, in definition order
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.order.iter().filter_map(move |key| self.messages.get(key))
    }

    /// All message keys, in definition order
    pub fn message_keys(&self) -> &[MessageKey] {
        &self.order
    }

    /// Messages transmitted by the given node
    pub fn messages_sent_by<'a>(
        &'a self,
        node: &'a str,
    ) -> impl Iterator<Item = &'a MessageDefinition> + 'a {
        self.messages()
            .filter(move |m| m.sender.as_deref() == Some(node))
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(MessageKey, &SignalDefinition)> {
        self.messages()
            .filter_map(|m| m.signal(signal_name).map(|s| (m.key, s)))
            .collect()
    }

    /// Get catalog statistics
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            num_nodes: self.nodes.len(),
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|m| m.signals.len()).sum(),
        }
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Number of declared nodes
    pub num_nodes: usize,
    /// Number of message definitions
    pub num_messages: usize,
    /// Number of signal definitions
    pub num_signals: usize,
}
