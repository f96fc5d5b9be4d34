//! Multi-DBC routing
//!
//! A session can load several DBC catalogs. Each arbitration id is owned by
//! exactly one of them: the first catalog that defined it. Later catalogs
//! defining the same id are reported as collisions and never take over, not
//! even after the owner is unloaded.

use crate::error::{AnalyzerError, EncodeError, DecodeError, Result};
use crate::events::{EventBus, EventKind};
use crate::message_codec::MessageCodec;
use crate::shared::SwapCell;
use crate::signals::catalog::{DbcCatalog, MessageDefinition};
use crate::signals::dbc::parse_dbc_file;
use crate::types::{CatalogKey, DecodedMessage, Frame, MessageKey};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// An id defined by more than one loaded catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCollision {
    /// Contested message identity
    pub key: MessageKey,
    /// Catalog that owns the id
    pub existing_key: CatalogKey,
    /// Catalog whose definition is ignored
    pub rejected_key: CatalogKey,
}

/// Outcome of a successful load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Number of ids now routed to the new catalog
    pub routed: usize,
    /// Ids that stayed with an earlier catalog
    pub collisions: Vec<RoutingCollision>,
}

/// Router statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub catalogs: usize,
    pub messages: usize,
    pub signals: usize,
    pub routes: usize,
    pub collisions: usize,
}

/// Immutable routing snapshot read by the RX hot path
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    catalogs: HashMap<CatalogKey, Arc<DbcCatalog>>,
    /// Catalog keys in load order
    order: Vec<CatalogKey>,
    routes: HashMap<MessageKey, CatalogKey>,
    collisions: Vec<RoutingCollision>,
}

impl RoutingTable {
    /// Catalog key owning the id
    pub fn resolve(&self, key: MessageKey) -> Option<&CatalogKey> {
        self.routes.get(&key)
    }

    /// Owning catalog key and message definition for the id
    pub fn message(&self, key: MessageKey) -> Option<(&CatalogKey, &MessageDefinition)> {
        let catalog_key = self.routes.get(&key)?;
        let message = self.catalogs.get(catalog_key)?.message(key)?;
        Some((catalog_key, message))
    }

    /// Decode a frame through its owning catalog, `None` if unrouted
    pub fn decode(&self, frame: &Frame) -> Option<std::result::Result<DecodedMessage, DecodeError>> {
        let (catalog_key, message) = self.message(frame.key())?;
        Some(MessageCodec::decode(catalog_key, &frame.data, message))
    }

    /// Loaded catalog by key
    pub fn catalog(&self, key: &str) -> Option<&Arc<DbcCatalog>> {
        self.catalogs.get(key)
    }

    /// Catalog keys in load order
    pub fn catalog_keys(&self) -> &[CatalogKey] {
        &self.order
    }

    /// Collisions among the loaded catalogs
    pub fn collisions(&self) -> &[RoutingCollision] {
        &self.collisions
    }

    /// Number of routed ids
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// The set of catalogs loaded in one session
pub struct MultiDbcRouter {
    table: SwapCell<RoutingTable>,
    events: EventBus,
}

impl MultiDbcRouter {
    /// Create an empty router reporting to `events`
    pub fn new(events: EventBus) -> Self {
        Self {
            table: SwapCell::default(),
            events,
        }
    }

    /// Current routing snapshot
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load()
    }

    /// Load a catalog under `key`
    ///
    /// Ids not yet routed are assigned to the new catalog; ids already owned
    /// by another catalog stay there and raise one collision event each.
    pub fn load(&self, catalog: DbcCatalog, key: impl Into<CatalogKey>) -> Result<LoadReport> {
        let key = key.into();
        let catalog = Arc::new(catalog);

        let result = self.table.try_update(|table| {
            if table.catalogs.contains_key(&key) {
                return Err(AnalyzerError::DuplicateFilename(key.clone()));
            }

            let mut report = LoadReport::default();
            for message_key in catalog.message_keys() {
                match table.routes.get(message_key) {
                    Some(owner) => report.collisions.push(RoutingCollision {
                        key: *message_key,
                        existing_key: owner.clone(),
                        rejected_key: key.clone(),
                    }),
                    None => {
                        table.routes.insert(*message_key, key.clone());
                        report.routed += 1;
                    }
                }
            }

            table.collisions.extend(report.collisions.iter().cloned());
            table.catalogs.insert(key.clone(), Arc::clone(&catalog));
            table.order.push(key.clone());
            Ok(report)
        });

        match result {
            Ok(report) => {
                log::info!(
                    "Loaded DBC '{}': {} messages, {} routed, {} collisions",
                    key,
                    catalog.stats().num_messages,
                    report.routed,
                    report.collisions.len()
                );
                for collision in &report.collisions {
                    self.events
                        .emit(EventKind::RoutingCollision(collision.clone()));
                }
                Ok(report)
            }
            Err(err) => {
                if let AnalyzerError::DuplicateFilename(key) = &err {
                    self.events
                        .emit(EventKind::DuplicateFilename { key: key.clone() });
                }
                Err(err)
            }
        }
    }

    /// Parse a DBC file and load it
    ///
    /// The default key is the file's basename. Parsing completes before any
    /// router state is touched.
    pub fn load_file(&self, path: &Path, key: Option<&str>) -> Result<LoadReport> {
        let key = match key {
            Some(key) => key.to_string(),
            None => default_catalog_key(path)?,
        };

        if self.table().catalogs.contains_key(&key) {
            self.events
                .emit(EventKind::DuplicateFilename { key: key.clone() });
            return Err(AnalyzerError::DuplicateFilename(key));
        }

        let catalog = parse_dbc_file(path)?;
        self.load(catalog, key)
    }

    /// Unload a catalog and every route it owns
    ///
    /// Freed ids become unrouted; other catalogs defining them do not take
    /// over.
    pub fn unload(&self, key: &str) -> Result<()> {
        let result = self.table.try_update(|table| {
            if table.catalogs.remove(key).is_none() {
                return Err(AnalyzerError::NotFound(format!("DBC '{}'", key)));
            }
            table.order.retain(|k| k != key);
            table.routes.retain(|_, owner| owner != key);
            table
                .collisions
                .retain(|c| c.existing_key != key && c.rejected_key != key);
            Ok(())
        });

        match &result {
            Ok(()) => log::info!("Unloaded DBC '{}'", key),
            Err(_) => self.events.emit(EventKind::NotFound {
                what: format!("DBC '{}'", key),
            }),
        }
        result
    }

    /// Catalog key owning the id
    pub fn resolve(&self, id: u32, extended: bool) -> Option<CatalogKey> {
        self.table()
            .resolve(MessageKey { id, extended })
            .cloned()
    }

    /// Decode a frame through its owning catalog, `None` if unrouted
    pub fn decode(&self, frame: &Frame) -> Option<std::result::Result<DecodedMessage, DecodeError>> {
        self.table().decode(frame)
    }

    /// Encode physical values for a message of the named catalog
    pub fn encode(
        &self,
        catalog_key: &str,
        key: MessageKey,
        values: &HashMap<String, f64>,
    ) -> std::result::Result<Vec<u8>, EncodeError> {
        let table = self.table();
        let message = table
            .catalog(catalog_key)
            .and_then(|catalog| catalog.message(key))
            .ok_or_else(|| EncodeError::UnknownMessage {
                catalog: catalog_key.to_string(),
                key,
            })?;
        MessageCodec::encode(message, values)
    }

    /// Loaded catalog by key
    pub fn catalog(&self, key: &str) -> Option<Arc<DbcCatalog>> {
        self.table().catalog(key).cloned()
    }

    /// Catalog keys in load order
    pub fn catalog_keys(&self) -> Vec<CatalogKey> {
        self.table().catalog_keys().to_vec()
    }

    /// Collisions among the loaded catalogs
    pub fn collisions(&self) -> Vec<RoutingCollision> {
        self.table().collisions().to_vec()
    }

    /// Get router statistics
    pub fn stats(&self) -> RouterStats {
        let table = self.table();
        let mut stats = RouterStats {
            catalogs: table.catalogs.len(),
            routes: table.routes.len(),
            collisions: table.collisions.len(),
            ..RouterStats::default()
        };
        for catalog in table.catalogs.values() {
            let catalog_stats = catalog.stats();
            stats.messages += catalog_stats.num_messages;
            stats.signals += catalog_stats.num_signals;
        }
        stats
    }
}

impl Default for MultiDbcRouter {
    fn default() -> Self {
        Self::new(EventBus::new("detached"))
    }
}

/// Basename of a DBC path, used as its catalog key
pub fn default_catalog_key(path: &Path) -> Result<CatalogKey> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| AnalyzerError::DbcParse(format!("{:?} has no file name", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::catalog::SignalDefinition;
    use crate::types::{CanFrame, Direction};

    fn catalog_with(id: u32, signal: &str) -> DbcCatalog {
        DbcCatalog::new().with_message(
            MessageDefinition::new(MessageKey::standard(id), format!("Msg_{}", signal), 8)
                .with_signal(
                    SignalDefinition::new(signal, 0, 16)
                        .with_scaling(0.1, 0.0)
                        .with_range(0.0, 6553.5),
                ),
        )
    }

    fn frame(id: u32, data: Vec<u8>) -> Frame {
        Frame::from_can(0, Arc::from("virtual:vcan0"), Direction::Rx, CanFrame::new(id, data))
    }

    #[test]
    fn test_first_loaded_wins() {
        let events = EventBus::new("s1");
        let rx = events.subscribe();
        let router = MultiDbcRouter::new(events);

        router.load(catalog_with(0x100, "Speed"), "A").unwrap();
        let report = router.load(catalog_with(0x100, "Speed2"), "B").unwrap();

        assert_eq!(report.routed, 0);
        assert_eq!(router.resolve(0x100, false), Some("A".to_string()));
        assert_eq!(router.resolve(0x100, true), None);

        let expected = RoutingCollision {
            key: MessageKey::standard(0x100),
            existing_key: "A".to_string(),
            rejected_key: "B".to_string(),
        };
        assert_eq!(router.collisions(), vec![expected.clone()]);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::RoutingCollision(expected));
        assert!(rx.try_recv().is_err());

        // raw 500 at scale 0.1
        let decoded = router
            .decode(&frame(0x100, vec![0xF4, 0x01, 0, 0, 0, 0, 0, 0]))
            .unwrap()
            .unwrap();
        assert_eq!(decoded.catalog, "A");
        assert!((decoded.signal("Speed").unwrap().value.as_f64() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_key_leaves_router_unchanged() {
        let router = MultiDbcRouter::default();
        router.load(catalog_with(0x100, "Speed"), "A").unwrap();
        let before = router.table();

        let err = router.load(catalog_with(0x200, "Rpm"), "A").unwrap_err();
        assert!(matches!(err, AnalyzerError::DuplicateFilename(k) if k == "A"));

        let after = router.table();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(router.resolve(0x200, false), None);
    }

    #[test]
    fn test_unload_does_not_reroute() {
        let router = MultiDbcRouter::default();
        router.load(catalog_with(0x100, "Speed"), "A").unwrap();
        router.load(catalog_with(0x100, "Speed2"), "B").unwrap();

        router.unload("A").unwrap();
        assert_eq!(router.resolve(0x100, false), None);
        assert!(router.collisions().is_empty());
        assert_eq!(router.catalog_keys(), vec!["B".to_string()]);

        assert!(matches!(router.unload("A"), Err(AnalyzerError::NotFound(_))));
    }

    #[test]
    fn test_unrouted_frame_is_not_decoded() {
        let router = MultiDbcRouter::default();
        router.load(catalog_with(0x100, "Speed"), "A").unwrap();
        assert!(router.decode(&frame(0x101, vec![0; 8])).is_none());
        assert!(router.decode(&frame(0x100, vec![0])).unwrap().is_err());
    }

    #[test]
    fn test_encode_through_catalog() {
        let router = MultiDbcRouter::default();
        router.load(catalog_with(0x100, "Speed"), "A").unwrap();

        let values = HashMap::from([("Speed".to_string(), 50.0)]);
        let payload = router
            .encode("A", MessageKey::standard(0x100), &values)
            .unwrap();
        assert_eq!(&payload[..2], &[0xF4, 0x01]);

        let err = router
            .encode("A", MessageKey::standard(0x999), &values)
            .unwrap_err();
        assert!(matches!(err, EncodeError::UnknownMessage { .. }));
    }

    #[test]
    fn test_stats() {
        let router = MultiDbcRouter::default();
        router.load(catalog_with(0x100, "Speed"), "A").unwrap();
        router.load(catalog_with(0x100, "Speed2"), "B").unwrap();
        router.load(catalog_with(0x200, "Rpm"), "C").unwrap();

        let stats = router.stats();
        assert_eq!(stats.catalogs, 3);
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.routes, 2);
        assert_eq!(stats.collisions, 1);
    }

    #[test]
    fn test_default_catalog_key() {
        assert_eq!(
            default_catalog_key(Path::new("/data/powertrain.dbc")).unwrap(),
            "powertrain.dbc"
        );
    }
}
