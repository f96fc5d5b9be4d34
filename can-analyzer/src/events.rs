//! Session event stream
//!
//! Every error category and lifecycle transition is delivered as a discrete
//! [`SessionEvent`] to each subscriber, and logged at the same time.

use crate::error::{DecodeError, EncodeError, TransportError};
use crate::router::RoutingCollision;
use crate::shared::lock;
use crate::tx::JobHandle;
use crate::types::{CatalogKey, SessionState, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::{Arc, Mutex};

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A loaded catalog defines an id already owned by an earlier catalog
    RoutingCollision(RoutingCollision),

    /// A DBC load was rejected because its filename key is already present
    DuplicateFilename { key: CatalogKey },

    /// Unload/cancel/remove referenced something that does not exist
    NotFound { what: String },

    /// A received frame could not be decoded (it is still traced)
    DecodeError { seq: u64, error: DecodeError },

    /// A transmit request could not be encoded
    EncodeError {
        job: Option<JobHandle>,
        error: EncodeError,
    },

    /// The transport refused a frame
    TxError {
        job: Option<JobHandle>,
        error: TransportError,
    },

    /// The transport failed; the session has stopped
    TransportError(TransportError),

    /// Lifecycle transition
    SessionStateChange { from: SessionState, to: SessionState },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::RoutingCollision(c) => write!(
                f,
                "routing collision on {}: kept '{}', rejected '{}'",
                c.key, c.existing_key, c.rejected_key
            ),
            EventKind::DuplicateFilename { key } => write!(f, "duplicate DBC key '{}'", key),
            EventKind::NotFound { what } => write!(f, "not found: {}", what),
            EventKind::DecodeError { seq, error } => {
                write!(f, "decode error at trace #{}: {}", seq, error)
            }
            EventKind::EncodeError { job, error } => match job {
                Some(job) => write!(f, "encode error in {}: {}", job, error),
                None => write!(f, "encode error: {}", error),
            },
            EventKind::TxError { job, error } => match job {
                Some(job) => write!(f, "tx error in {}: {}", job, error),
                None => write!(f, "tx error: {}", error),
            },
            EventKind::TransportError(error) => write!(f, "transport error: {}", error),
            EventKind::SessionStateChange { from, to } => write!(f, "state {} -> {}", from, to),
        }
    }
}

/// An event raised by one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Id of the session that raised the event
    pub session_id: Arc<str>,
    /// Wall-clock time the event was raised
    pub at: Timestamp,
    pub kind: EventKind,
}

/// Fan-out of session events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    session_id: Arc<str>,
    subscribers: Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl EventBus {
    /// Create a bus for one session
    pub fn new(session_id: impl Into<Arc<str>>) -> Self {
        Self {
            session_id: session_id.into(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Session id stamped on every event
    pub fn session_id(&self) -> &Arc<str> {
        &self.session_id
    }

    /// Register a new subscriber; it sees events raised from now on
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Log and deliver an event; subscribers whose receiver is gone are pruned
    pub fn emit(&self, kind: EventKind) {
        match &kind {
            EventKind::SessionStateChange { .. } => {
                log::info!("[session {}] {}", self.session_id, kind)
            }
            EventKind::DecodeError { .. } => log::debug!("[session {}] {}", self.session_id, kind),
            _ => log::warn!("[session {}] {}", self.session_id, kind),
        }

        let event = SessionEvent {
            session_id: Arc::clone(&self.session_id),
            at: chrono::Utc::now(),
            kind,
        };

        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_events() {
        let bus = EventBus::new("abcd1234");
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(EventKind::DuplicateFilename {
            key: "A.dbc".to_string(),
        });

        for rx in [&a, &b] {
            let event = rx.try_recv().unwrap();
            assert_eq!(&*event.session_id, "abcd1234");
            assert_eq!(
                event.kind,
                EventKind::DuplicateFilename {
                    key: "A.dbc".to_string()
                }
            );
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new("s1");
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(EventKind::NotFound {
            what: "job #7".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
