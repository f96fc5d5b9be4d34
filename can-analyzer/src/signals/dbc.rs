//! DBC file parser
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into a
//! [`DbcCatalog`].

use crate::error::{AnalyzerError, Result};
use crate::signals::catalog::{
    ByteOrder, DbcCatalog, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{MessageKey, MAX_EXTENDED_ID};
use std::collections::HashMap;
use std::path::Path;

/// Bit 31 of a DBC message id marks a 29-bit identifier
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Attribute carrying the raw start value of a signal
const START_VALUE_ATTRIBUTE: &str = "GenSigStartValue";

/// Parse a DBC file into a catalog
pub fn parse_dbc_file(path: &Path) -> Result<DbcCatalog> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        AnalyzerError::DbcParse(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1 (Windows-1252 compatible)
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(err) => {
            log::warn!("DBC file {:?} is not UTF-8, trying Latin-1 encoding", path);
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let catalog = parse_dbc_str(&content)
        .map_err(|e| AnalyzerError::DbcParse(format!("{:?}: {}", path, e)))?
        .with_path(path);

    let stats = catalog.stats();
    log::info!(
        "Parsed {} messages ({} signals) from {:?}",
        stats.num_messages,
        stats.num_signals,
        path
    );

    Ok(catalog)
}

/// Parse DBC text into a catalog
pub fn parse_dbc_str(content: &str) -> Result<DbcCatalog> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| AnalyzerError::DbcParse(format!("{:?}", e)))?;

    let start_values = collect_start_values(&dbc);
    let mut catalog = DbcCatalog::new();

    for node in dbc.nodes() {
        for name in &node.0 {
            catalog.add_node(name.clone());
        }
    }

    for dbc_msg in dbc.messages() {
        catalog.add_message(convert_message(dbc_msg, &start_values)?);
    }

    Ok(catalog)
}

/// Raw `GenSigStartValue` per (message id, signal name)
fn collect_start_values(dbc: &can_dbc::DBC) -> HashMap<(u32, String), f64> {
    let mut values = HashMap::new();
    for attribute in dbc.attribute_values() {
        if attribute.attribute_name() != START_VALUE_ATTRIBUTE {
            continue;
        }
        if let can_dbc::AttributeValuedForObjectType::SignalAttributeValue(msg_id, signal, value) =
            attribute.attribute_value()
        {
            let raw = match value {
                can_dbc::AttributeValue::AttributeValueF64(v) => *v,
                can_dbc::AttributeValue::AttributeValueU64(v) => *v as f64,
                can_dbc::AttributeValue::AttributeValueI64(v) => *v as f64,
                _ => continue,
            };
            values.insert((msg_id.0, signal.clone()), raw);
        }
    }
    values
}

/// Split a DBC message id into a message key
fn message_key(raw_id: u32) -> MessageKey {
    if raw_id & DBC_EXTENDED_FLAG != 0 {
        MessageKey::extended(raw_id & MAX_EXTENDED_ID)
    } else {
        MessageKey::standard(raw_id)
    }
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(
    dbc_msg: &can_dbc::Message,
    start_values: &HashMap<(u32, String), f64>,
) -> Result<MessageDefinition> {
    let raw_id = dbc_msg.message_id().0;

    // First pass: identify multiplexer signal
    let multiplexer_signal_name = dbc_msg
        .signals()
        .iter()
        .find(|s| {
            matches!(
                s.multiplexer_indicator(),
                can_dbc::MultiplexIndicator::Multiplexor
                    | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_)
            )
        })
        .map(|s| s.name().to_string());

    let mut message = MessageDefinition::new(
        message_key(raw_id),
        dbc_msg.message_name().to_string(),
        *dbc_msg.message_size() as usize,
    );
    if let can_dbc::Transmitter::NodeName(name) = dbc_msg.transmitter() {
        message.sender = Some(name.to_string());
    }
    message.multiplexer_signal = multiplexer_signal_name.clone();

    // Second pass: convert all signals
    for dbc_sig in dbc_msg.signals() {
        let start_raw = start_values
            .get(&(raw_id, dbc_sig.name().to_string()))
            .copied();
        let signal = convert_signal(dbc_sig, multiplexer_signal_name.as_deref(), start_raw)?;
        message.signals.push(signal);
    }

    Ok(message)
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
    start_raw: Option<f64>,
) -> Result<SignalDefinition> {
    let length = *dbc_sig.signal_size();
    if length == 0 || length > 64 {
        return Err(AnalyzerError::InvalidSignalDefinition(format!(
            "Signal '{}' has unsupported length {}",
            dbc_sig.name(),
            length
        )));
    }

    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value)
        | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            let multiplexer = multiplexer_signal_name.ok_or_else(|| {
                AnalyzerError::InvalidSignalDefinition(format!(
                    "Multiplexed signal '{}' but no multiplexer found",
                    dbc_sig.name()
                ))
            })?;
            Some(MultiplexerInfo {
                multiplexer_signal: multiplexer.to_string(),
                multiplexer_values: vec![switch_value],
            })
        }
        _ => None,
    };

    let factor = *dbc_sig.factor();
    let offset = *dbc_sig.offset();

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: length as u16,
        byte_order,
        value_type,
        factor,
        offset,
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        default_value: start_raw.map(|raw| offset + factor * raw),
        receivers: dbc_sig.receivers().clone(),
        multiplexer_info,
    })
}
