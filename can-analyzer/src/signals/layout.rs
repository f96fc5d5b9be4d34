//! Bit layout of a signal inside a frame payload
//!
//! The same precomputed spans drive both extraction (decode) and packing
//! (encode), so the two are inverses by construction.

use crate::signals::catalog::ByteOrder;

/// A 64-bit signal touches at most 9 bytes (one partial byte at each end)
const MAX_SPANS: usize = 9;

/// One contiguous run of bits within a single payload byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BitSpan {
    byte_index: usize,
    /// Lowest bit position within the byte (0..=7)
    bit_offset: u8,
    /// Number of consecutive bits (1..=8)
    num_bits: u8,
    /// Shift of these bits inside the raw value
    value_shift: u8,
}

/// Mapping from a DBC start bit + byte order to payload byte/bit positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalLayout {
    spans: [BitSpan; MAX_SPANS],
    count: usize,
    length: u16,
}

impl SignalLayout {
    /// Build the layout for a signal
    ///
    /// Little-endian (Intel): `start_bit` is the LSB, bits grow upward within
    /// a byte and continue at bit 0 of the next byte.
    /// Big-endian (Motorola): `start_bit` is the MSB, bits grow downward within
    /// a byte and continue at bit 7 of the next byte.
    ///
    /// Lengths above 64 bits are truncated to 64.
    pub fn new(start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        let length = length.min(64);
        let mut spans = [BitSpan::default(); MAX_SPANS];
        let mut count = 0;
        let mut byte_index = (start_bit / 8) as usize;
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = length as u32;

        match byte_order {
            ByteOrder::BigEndian => {
                while remaining > 0 && count < MAX_SPANS {
                    let num_bits = (bit_index as u32 + 1).min(remaining) as u8;
                    let bit_offset = bit_index + 1 - num_bits;
                    remaining -= num_bits as u32;
                    spans[count] = BitSpan {
                        byte_index,
                        bit_offset,
                        num_bits,
                        value_shift: remaining as u8,
                    };
                    count += 1;
                    byte_index += 1;
                    bit_index = 7;
                }
            }
            ByteOrder::LittleEndian => {
                let mut value_shift = 0u32;
                while remaining > 0 && count < MAX_SPANS {
                    let num_bits = (8 - bit_index as u32).min(remaining) as u8;
                    spans[count] = BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift: value_shift as u8,
                    };
                    count += 1;
                    value_shift += num_bits as u32;
                    remaining -= num_bits as u32;
                    byte_index += 1;
                    bit_index = 0;
                }
            }
        }

        Self {
            spans,
            count,
            length,
        }
    }

    /// Signal length in bits
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Minimum payload length (in bytes) needed to hold the signal
    pub fn required_bytes(&self) -> usize {
        self.spans[..self.count]
            .iter()
            .map(|span| span.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Extract the raw unsigned value, `None` if the payload is too short
    pub fn extract(&self, data: &[u8]) -> Option<u64> {
        if self.required_bytes() > data.len() {
            return None;
        }

        let mut result: u64 = 0;
        for span in &self.spans[..self.count] {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = (data[span.byte_index] >> span.bit_offset) & mask;
            result |= (bits as u64) << span.value_shift;
        }
        Some(result)
    }

    /// Pack a raw unsigned value into the payload
    ///
    /// Target bits are cleared before writing so several signals can share a
    /// payload. Returns `false` (payload untouched) if the payload is too short.
    pub fn pack(&self, data: &mut [u8], raw: u64) -> bool {
        if self.required_bytes() > data.len() {
            return false;
        }

        for span in &self.spans[..self.count] {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
        true
    }
}

/// Sign-extend a value from N bits to 64 bits
pub fn sign_extend(value: u64, bit_length: u16) -> i64 {
    if bit_length == 0 || bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

/// Truncate a (possibly negative) raw value to its N-bit two's complement form
pub fn truncate_bits(value: i64, bit_length: u16) -> u64 {
    if bit_length >= 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << bit_length) - 1)
    }
}
