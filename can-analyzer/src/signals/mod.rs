//! Signal catalogs and the DBC parser
//!
//! This module contains the DBC adapter, the per-file catalog model and the
//! bit layout shared by decoding and encoding.

pub mod catalog;
pub mod dbc;
pub mod layout;

// Re-export key types for convenience
pub use catalog::{
    ByteOrder, CatalogStats, DbcCatalog, MessageDefinition, MultiplexerInfo, NodeDefinition,
    SignalDefinition, ValueType,
};
pub use dbc::{parse_dbc_file, parse_dbc_str};
pub use layout::SignalLayout;
