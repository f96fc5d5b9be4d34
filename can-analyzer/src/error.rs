//! Error taxonomy of the session runtime
//!
//! Per-frame and per-send failures have their own small enums so they can be
//! attached to trace points and job statuses; everything converts into
//! [`AnalyzerError`] for the public API.

use crate::types::{MessageKey, SessionState};

/// Result type for session runtime operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Per-frame decode failure (the frame is still traced)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Signal '{signal}' of {key} needs {required} bytes but the frame carries {available}")]
    PayloadTooShort {
        key: MessageKey,
        signal: String,
        required: usize,
        available: usize,
    },
}

/// Per-send encode failure (only the affected one-shot or job fails)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("Message {key} is not defined in catalog '{catalog}'")]
    UnknownMessage { catalog: String, key: MessageKey },

    #[error("Message '{message}' has no signal named '{signal}'")]
    UnknownSignal { message: String, signal: String },

    #[error("Signal '{signal}' of '{message}' has no value and no declared default")]
    MissingSignal { message: String, signal: String },

    #[error("Value {value} for signal '{signal}' is outside [{min}, {max}]")]
    OutOfRange {
        signal: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Signal '{signal}' does not fit in the {size} byte payload of '{message}'")]
    LayoutOverflow {
        message: String,
        signal: String,
        size: usize,
    },
}

/// Transport-level failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Interface disconnected: {0}")]
    Disconnected(String),

    #[error("Transport busy: {0}")]
    Busy(String),

    #[error("Unsupported interface: {0}")]
    Unsupported(String),

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Errors surfaced by the public session API
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("DBC filename '{0}' is already loaded for this session")]
    DuplicateFilename(String),

    #[error("Session name '{0}' is already in use")]
    DuplicateSessionName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
