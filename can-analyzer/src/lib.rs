//! CAN Analyzer Session Runtime
//!
//! A library for watching and driving several CAN interfaces at once, each
//! decoded against its own set of DBC catalogs.
//!
//! # Architecture
//!
//! Every [`CanSession`] is independent and owns:
//! - a [`MultiDbcRouter`] deciding which loaded catalog decodes a frame id
//!   (first loaded wins, later definitions are reported as collisions)
//! - a [`FilterSet`] gating the plotting and logging paths
//! - a bounded [`TraceBuffer`] of every frame seen, decoded on demand
//! - a [`DataStore`] of decoded signal time series
//! - an RX worker and a TX worker (one-shot and fixed-rate periodic sends)
//!
//! The library does NOT:
//! - Ship hardware drivers (implement [`Transport`] for those)
//! - Define a log file format (install a [`FrameSink`])
//! - Render anything
//!
//! # Example Usage
//!
//! ```no_run
//! use can_analyzer::{
//!     CanSession, InterfaceConfig, SeriesKey, SessionConfig, TimeRange, TxRequest, VirtualBus,
//! };
//! use std::collections::HashMap;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let bus = VirtualBus::new();
//! let config = SessionConfig::new("Powertrain", InterfaceConfig::virtual_channel("vcan0"));
//! let session = CanSession::open(config, Arc::new(bus)).unwrap();
//!
//! session.load_dbc(Path::new("powertrain.dbc"), None).unwrap();
//! session.start().unwrap();
//!
//! let values = HashMap::from([("EngineSpeed".to_string(), 1500.0)]);
//! let key = session.router().table().catalog("powertrain.dbc").unwrap()
//!     .message_by_name("EngineData").unwrap().key;
//! session
//!     .schedule(TxRequest::dbc("powertrain.dbc", key, values), 100)
//!     .unwrap();
//!
//! let series = SeriesKey::new(session.id(), "powertrain.dbc", key, "EngineSpeed");
//! for point in session.data().query(&series, TimeRange::all()) {
//!     println!("{} us: {}", point.timestamp_us, point.value);
//! }
//! session.close();
//! ```

// Public modules
pub mod config;
pub mod datastore;
pub mod error;
pub mod events;
pub mod filter;
pub mod message_codec;
pub mod registry;
pub mod router;
pub mod rx;
pub mod session;
pub mod signals;
pub mod sink;
pub mod trace;
pub mod transport;
pub mod tx;
pub mod types;

// Internal modules
mod shared;

// Re-export main types for convenience
pub use config::{InterfaceConfig, SessionConfig};
pub use datastore::{DataStore, DataStoreStats, SeriesKey, SeriesPoint, TimeRange};
pub use error::{AnalyzerError, DecodeError, EncodeError, Result, TransportError};
pub use events::{EventBus, EventKind, SessionEvent};
pub use filter::{FilterMode, FilterPath, FilterPaths, FilterRule, FilterScope, FilterTarget};
pub use message_codec::MessageCodec;
pub use registry::SessionRegistry;
pub use router::{LoadReport, MultiDbcRouter, RouterStats, RoutingCollision};
pub use rx::{FrameOutcome, RxStats};
pub use session::CanSession;
pub use signals::{
    parse_dbc_file, parse_dbc_str, ByteOrder, DbcCatalog, MessageDefinition, SignalDefinition,
    ValueType,
};
pub use sink::{FrameSink, QueuedSink, SinkFn, SinkStats};
pub use trace::{TraceBuffer, TracePoint, TraceStats};
pub use transport::{Transport, TransportFactory, VirtualBus, VirtualTransport};
pub use tx::{JobHandle, JobStatus, TxRequest};
pub use types::{
    CanFrame, CatalogKey, DecodedMessage, DecodedSignal, Direction, Frame, MessageKey,
    SessionState, SignalValue, Timebase, Timestamp,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: a fresh router has nothing loaded
        let router = MultiDbcRouter::default();
        let stats = router.stats();
        assert_eq!(stats.catalogs, 0);
        assert_eq!(stats.routes, 0);
        assert!(!VERSION.is_empty());
    }
}
