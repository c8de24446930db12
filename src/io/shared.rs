//! Tree-wide shared I/O bitmaps.
//!
//! `inputs[c]` has bit `b` set when the device with bit index `b` reports its
//! local input `c` active. `outputs[c]` is the root's decision for output line
//! `c` of every device, produced by the output policy.
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::tree::identity::MAX_BIT_INDEX;

/// Logical input (and output) channels per device.
pub const CHANNELS: usize = 3;

/// Current format: three input words followed by three output words.
pub const FULL_PAYLOAD_LEN: usize = CHANNELS * 4 * 2;
/// Legacy: three input words only.
pub const LEGACY_INPUTS_PAYLOAD_LEN: usize = CHANNELS * 4;
/// Legacy: a single input word for channel 0.
pub const LEGACY_SINGLE_PAYLOAD_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedPayloadError {
    #[error(
        "invalid distributed I/O payload size {0} (expected {full}, {legacy} or {single})",
        full = FULL_PAYLOAD_LEN,
        legacy = LEGACY_INPUTS_PAYLOAD_LEN,
        single = LEGACY_SINGLE_PAYLOAD_LEN
    )]
    BadLength(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct SharedIoState {
    pub inputs: [u32; CHANNELS],
    pub outputs: [u32; CHANNELS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Input,
    Output,
}

/// One bit that differs between two shared states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitChange {
    pub line: Line,
    pub channel: usize,
    pub bit: u8,
    pub set: bool,
}

impl fmt::Display for BitChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Line::Input => write!(
                f,
                "device bit {} input {} {}",
                self.bit,
                self.channel + 1,
                if self.set { "pressed" } else { "released" }
            ),
            Line::Output => write!(
                f,
                "device bit {} output {} {}",
                self.bit,
                self.channel + 1,
                if self.set { "on" } else { "off" }
            ),
        }
    }
}

fn in_range(channel: usize, bit: u8) -> bool {
    channel < CHANNELS && bit < MAX_BIT_INDEX
}

impl SharedIoState {
    pub fn input_bit(&self, channel: usize, bit: u8) -> bool {
        in_range(channel, bit) && self.inputs[channel] & (1 << bit) != 0
    }

    pub fn output_bit(&self, channel: usize, bit: u8) -> bool {
        in_range(channel, bit) && self.outputs[channel] & (1 << bit) != 0
    }

    /// Out-of-range indices are ignored.
    pub fn set_input_bit(&mut self, channel: usize, bit: u8, value: bool) {
        if in_range(channel, bit) {
            set_bit(&mut self.inputs[channel], bit, value);
        }
    }

    pub fn set_output_bit(&mut self, channel: usize, bit: u8, value: bool) {
        if in_range(channel, bit) {
            set_bit(&mut self.outputs[channel], bit, value);
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    /// Accepts the current format and both legacy sizes.
    pub fn from_payload(payload: &[u8]) -> Result<Self, SharedPayloadError> {
        let words: Vec<u32> = match payload.len() {
            FULL_PAYLOAD_LEN | LEGACY_INPUTS_PAYLOAD_LEN | LEGACY_SINGLE_PAYLOAD_LEN => payload
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            other => return Err(SharedPayloadError::BadLength(other)),
        };
        let mut state = SharedIoState::default();
        for (i, word) in words.into_iter().enumerate() {
            if i < CHANNELS {
                state.inputs[i] = word;
            } else {
                state.outputs[i - CHANNELS] = word;
            }
        }
        Ok(state)
    }

    /// Every bit that flipped going from `self` to `new`, inputs first.
    pub fn changes_to(&self, new: &SharedIoState) -> Vec<BitChange> {
        let mut changes = Vec::new();
        for (line, old_words, new_words) in [
            (Line::Input, &self.inputs, &new.inputs),
            (Line::Output, &self.outputs, &new.outputs),
        ] {
            for channel in 0..CHANNELS {
                let diff = old_words[channel] ^ new_words[channel];
                for bit in 0..MAX_BIT_INDEX {
                    if diff & (1 << bit) != 0 {
                        changes.push(BitChange {
                            line,
                            channel,
                            bit,
                            set: new_words[channel] & (1 << bit) != 0,
                        });
                    }
                }
            }
        }
        changes
    }
}

fn set_bit(word: &mut u32, bit: u8, value: bool) {
    if value {
        *word |= 1 << bit;
    } else {
        *word &= !(1 << bit);
    }
}

impl fmt::Display for SharedIoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, w) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "I{}:0x{:08X}", i + 1, w)?;
        }
        write!(f, " || ")?;
        for (i, w) in self.outputs.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "Q{}:0x{:08X}", i + 1, w)?;
        }
        Ok(())
    }
}
