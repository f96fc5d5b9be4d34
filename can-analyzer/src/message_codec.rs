//! Message decoding and encoding engine
//!
//! Extracts signal values from raw payloads based on message definitions and
//! packs physical values back into payload bytes. Both directions go through
//! the same [`SignalLayout`](crate::signals::SignalLayout), handle
//! multiplexing, and apply the factor/offset conversion.

use crate::error::{DecodeError, EncodeError};
use crate::signals::catalog::{MessageDefinition, SignalDefinition, ValueType};
use crate::signals::layout::{sign_extend, truncate_bits};
use crate::types::{DecodedMessage, DecodedSignal, SignalValue};
use std::collections::HashMap;

/// Message codec - converts between payload bytes and physical signal values
pub struct MessageCodec;

impl MessageCodec {
    /// Decode a payload into a [`DecodedMessage`]
    ///
    /// Only signals active for the current multiplexer value are decoded. If
    /// any active signal extends past the payload the whole frame fails, so a
    /// partially decoded message is never produced.
    pub fn decode(
        catalog: &str,
        data: &[u8],
        message: &MessageDefinition,
    ) -> Result<DecodedMessage, DecodeError> {
        // For multiplexed messages, first extract the multiplexer signal value
        let multiplexer_value = match message.multiplexer() {
            Some(mux) => Some(Self::extract_raw(data, message, mux)? as u64),
            None => None,
        };

        let mut signals = Vec::with_capacity(message.signals.len());
        for signal in &message.signals {
            if !Self::is_active(signal, multiplexer_value) {
                continue;
            }
            let raw_value = Self::extract_raw(data, message, signal)?;
            signals.push(Self::decode_signal(signal, raw_value));
        }

        log::trace!(
            "Decoded {} ({}) with {} signals",
            message.name,
            message.key,
            signals.len()
        );

        Ok(DecodedMessage {
            catalog: catalog.to_string(),
            key: message.key,
            message_name: message.name.clone(),
            sender: message.sender.clone(),
            signals,
            multiplexer_value,
        })
    }

    /// Encode physical values into a payload of `message.size` bytes
    ///
    /// Signals left out of `values` fall back to their declared default.
    /// Values for multiplexed signals that are not active for the selected
    /// multiplexer value are ignored.
    pub fn encode(
        message: &MessageDefinition,
        values: &HashMap<String, f64>,
    ) -> Result<Vec<u8>, EncodeError> {
        if let Some(name) = values.keys().find(|name| message.signal(name).is_none()) {
            return Err(EncodeError::UnknownSignal {
                message: message.name.clone(),
                signal: name.clone(),
            });
        }

        let multiplexer_value = match message.multiplexer() {
            Some(mux) => {
                let value = Self::value_for(message, mux, values)?;
                Some(Self::physical_to_raw(mux, value)? as u64)
            }
            None => None,
        };

        let mut payload = vec![0u8; message.size];
        for signal in &message.signals {
            if !Self::is_active(signal, multiplexer_value) {
                continue;
            }

            let value = Self::value_for(message, signal, values)?;
            let raw = Self::physical_to_raw(signal, value)?;
            if !signal
                .layout()
                .pack(&mut payload, truncate_bits(raw, signal.length))
            {
                return Err(EncodeError::LayoutOverflow {
                    message: message.name.clone(),
                    signal: signal.name.clone(),
                    size: message.size,
                });
            }
        }

        Ok(payload)
    }

    /// True if the signal is present for the given multiplexer value
    fn is_active(signal: &SignalDefinition, multiplexer_value: Option<u64>) -> bool {
        match (&signal.multiplexer_info, multiplexer_value) {
            (None, _) => true,
            (Some(info), Some(value)) => info.multiplexer_values.contains(&value),
            (Some(_), None) => false,
        }
    }

    /// Extract the raw (sign-extended) value of one signal
    fn extract_raw(
        data: &[u8],
        message: &MessageDefinition,
        signal: &SignalDefinition,
    ) -> Result<i64, DecodeError> {
        let layout = signal.layout();
        let raw = layout
            .extract(data)
            .ok_or_else(|| DecodeError::PayloadTooShort {
                key: message.key,
                signal: signal.name.clone(),
                required: layout.required_bytes(),
                available: data.len(),
            })?;

        Ok(match signal.value_type {
            ValueType::Unsigned => raw as i64,
            ValueType::Signed => sign_extend(raw, signal.length),
        })
    }

    /// Build the decoded signal from its raw value
    fn decode_signal(signal: &SignalDefinition, raw_value: i64) -> DecodedSignal {
        let scaled = signal.factor != 1.0 || signal.offset != 0.0;

        let value = if !scaled && signal.length == 1 {
            // Boolean signal (single bit, no scaling)
            SignalValue::Boolean(raw_value != 0)
        } else if scaled {
            SignalValue::Float(Self::raw_to_physical(signal, raw_value))
        } else {
            SignalValue::Integer(raw_value)
        };

        DecodedSignal {
            name: signal.name.clone(),
            value,
            unit: signal.unit.clone(),
            raw_value,
            min: signal.min,
            max: signal.max,
        }
    }

    fn raw_to_physical(signal: &SignalDefinition, raw_value: i64) -> f64 {
        let raw = match signal.value_type {
            // A 64-bit unsigned raw value does not fit an i64
            ValueType::Unsigned => raw_value as u64 as f64,
            ValueType::Signed => raw_value as f64,
        };
        signal.offset + signal.factor * raw
    }

    /// Requested value, falling back to the declared default
    fn value_for(
        message: &MessageDefinition,
        signal: &SignalDefinition,
        values: &HashMap<String, f64>,
    ) -> Result<f64, EncodeError> {
        values
            .get(&signal.name)
            .copied()
            .or(signal.default_value)
            .ok_or_else(|| EncodeError::MissingSignal {
                message: message.name.clone(),
                signal: signal.name.clone(),
            })
    }

    /// Physical → raw via offset/factor, checked against the declared range
    /// and the signal's bit width
    fn physical_to_raw(signal: &SignalDefinition, value: f64) -> Result<i64, EncodeError> {
        if signal.has_range() {
            let tolerance = 1e-9 * signal.min.abs().max(signal.max.abs()).max(1.0);
            if !value.is_finite()
                || value < signal.min - tolerance
                || value > signal.max + tolerance
            {
                return Err(EncodeError::OutOfRange {
                    signal: signal.name.clone(),
                    value,
                    min: signal.min,
                    max: signal.max,
                });
            }
        }

        let factor = if signal.factor == 0.0 { 1.0 } else { signal.factor };
        let raw = ((value - signal.offset) / factor).round();

        let (raw_min, raw_max) = Self::raw_bounds(signal);
        if !raw.is_finite() || raw < raw_min || raw > raw_max {
            let a = signal.offset + factor * raw_min;
            let b = signal.offset + factor * raw_max;
            return Err(EncodeError::OutOfRange {
                signal: signal.name.clone(),
                value,
                min: a.min(b),
                max: a.max(b),
            });
        }

        Ok(match signal.value_type {
            ValueType::Unsigned if raw >= 9.223_372_036_854_776e18 => raw as u64 as i64,
            _ => raw as i64,
        })
    }

    /// Representable raw range for the signal's length and signedness
    fn raw_bounds(signal: &SignalDefinition) -> (f64, f64) {
        let bits = i32::from(signal.length.clamp(1, 64));
        match signal.value_type {
            ValueType::Unsigned => (0.0, 2f64.powi(bits) - 1.0),
            ValueType::Signed => (-(2f64.powi(bits - 1)), 2f64.powi(bits - 1) - 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKey;

    fn speed_message() -> MessageDefinition {
        MessageDefinition::new(MessageKey::standard(0x100), "VehicleSpeed", 8).with_signal(
            SignalDefinition::new("Speed", 0, 16)
                .with_scaling(0.1, 0.0)
                .with_range(0.0, 250.0)
                .with_unit("km/h"),
        )
    }

    fn mux_message() -> MessageDefinition {
        MessageDefinition::new(MessageKey::standard(0x200), "Diag", 8)
            .with_multiplexer("Mode")
            .with_signal(SignalDefinition::new("Mode", 0, 8))
            .with_signal(SignalDefinition::new("SignalA", 8, 16).multiplexed_by("Mode", 0))
            .with_signal(
                SignalDefinition::new("SignalB", 8, 16)
                    .with_scaling(0.1, 0.0)
                    .multiplexed_by("Mode", 1),
            )
    }

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_decode_scaled_signal() {
        // raw 500 = 0x01F4
        let data = [0xF4, 0x01, 0, 0, 0, 0, 0, 0];
        let decoded = MessageCodec::decode("A.dbc", &data, &speed_message()).unwrap();
        let speed = decoded.signal("Speed").unwrap();
        assert_eq!(speed.raw_value, 500);
        assert!((speed.value.as_f64() - 50.0).abs() < 1e-9);
        assert_eq!(decoded.catalog, "A.dbc");
    }

    #[test]
    fn test_decode_is_not_clamped() {
        // raw 3000 -> 300 km/h, above the declared 250
        let data = 3000u16.to_le_bytes();
        let decoded = MessageCodec::decode("A.dbc", &data, &speed_message()).unwrap();
        let speed = decoded.signal("Speed").unwrap();
        assert!((speed.value.as_f64() - 300.0).abs() < 1e-9);
        assert_eq!(speed.clamped_value(), 250.0);
    }

    #[test]
    fn test_decode_short_payload_fails_whole_frame() {
        let err = MessageCodec::decode("A.dbc", &[0x01], &speed_message()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PayloadTooShort {
                key: MessageKey::standard(0x100),
                signal: "Speed".to_string(),
                required: 2,
                available: 1,
            }
        );
    }

    #[test]
    fn test_decode_multiplexed() {
        let data = [0x01, 0x64, 0x00, 0, 0, 0, 0, 0];
        let decoded = MessageCodec::decode("D.dbc", &data, &mux_message()).unwrap();
        assert_eq!(decoded.multiplexer_value, Some(1));
        assert!(decoded.signal("SignalA").is_none());
        let b = decoded.signal("SignalB").unwrap();
        assert!((b.value.as_f64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_signed_and_boolean() {
        let message = MessageDefinition::new(MessageKey::extended(0x18FF_0001), "Mixed", 2)
            .with_signal(SignalDefinition::new("Temp", 0, 8).signed())
            .with_signal(SignalDefinition::new("Flag", 8, 1));
        let decoded = MessageCodec::decode("M.dbc", &[0xFF, 0x01], &message).unwrap();
        assert_eq!(decoded.signal("Temp").unwrap().value, SignalValue::Integer(-1));
        assert_eq!(decoded.signal("Flag").unwrap().value, SignalValue::Boolean(true));
    }

    #[test]
    fn test_encode_scaled_signal() {
        let payload = MessageCodec::encode(&speed_message(), &values(&[("Speed", 50.0)])).unwrap();
        assert_eq!(payload, vec![0xF4, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_out_of_range() {
        let err = MessageCodec::encode(&speed_message(), &values(&[("Speed", 300.0)])).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfRange { .. }));
    }

    #[test]
    fn test_encode_missing_and_unknown_signals() {
        let err = MessageCodec::encode(&speed_message(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, EncodeError::MissingSignal { .. }));

        let err = MessageCodec::encode(&speed_message(), &values(&[("Speed", 1.0), ("Rpm", 2.0)]))
            .unwrap_err();
        assert!(matches!(err, EncodeError::UnknownSignal { .. }));
    }

    #[test]
    fn test_encode_uses_default_value() {
        let message = MessageDefinition::new(MessageKey::standard(0x300), "Climate", 1)
            .with_signal(
                SignalDefinition::new("Temp", 0, 8)
                    .with_scaling(1.0, -40.0)
                    .with_default(20.0),
            );
        let payload = MessageCodec::encode(&message, &HashMap::new()).unwrap();
        assert_eq!(payload, vec![60]);
    }

    #[test]
    fn test_encode_raw_overflow_without_range() {
        let message = MessageDefinition::new(MessageKey::standard(0x301), "Small", 1)
            .with_signal(SignalDefinition::new("Nibble", 0, 4));
        let err = MessageCodec::encode(&message, &values(&[("Nibble", 16.0)])).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfRange { .. }));
    }

    #[test]
    fn test_encode_layout_overflow() {
        let message = MessageDefinition::new(MessageKey::standard(0x302), "Tiny", 1)
            .with_signal(SignalDefinition::new("Wide", 0, 16));
        let err = MessageCodec::encode(&message, &values(&[("Wide", 1.0)])).unwrap_err();
        assert!(matches!(err, EncodeError::LayoutOverflow { .. }));
    }

    #[test]
    fn test_encode_multiplexed_round_trip() {
        let message = mux_message();
        let payload =
            MessageCodec::encode(&message, &values(&[("Mode", 0.0), ("SignalA", 1234.0)])).unwrap();
        let decoded = MessageCodec::decode("D.dbc", &payload, &message).unwrap();
        assert_eq!(decoded.multiplexer_value, Some(0));
        assert_eq!(decoded.signal("SignalA").unwrap().raw_value, 1234);
    }

    #[test]
    fn test_big_endian_round_trip() {
        let message = MessageDefinition::new(MessageKey::standard(0x400), "Motorola", 4)
            .with_signal(SignalDefinition::new("Pressure", 7, 12).big_endian())
            .with_signal(SignalDefinition::new("Level", 11, 20).big_endian().signed());
        let payload = [0xAB, 0xCD, 0xEF, 0x12];
        let decoded = MessageCodec::decode("M.dbc", &payload, &message).unwrap();
        let encoded = MessageCodec::encode(&message, &decoded.physical_values()).unwrap();
        assert_eq!(encoded, payload.to_vec());
    }
}
