//! Local device I/O: the data-report payload, the physical pin seam, and the
//! mapping from shared channels onto this device's output pins.
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::shared::{SharedIoState, CHANNELS};

pub const MAX_INPUT_PINS: usize = 8;
pub const MAX_OUTPUT_PINS: usize = 8;
pub const DEFAULT_PINS_PER_CHANNEL: usize = 3;
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// Encoded size of [`DeviceSpecificData`] on the wire.
pub const DEVICE_DATA_LEN: usize = 14;

/// Payload of a data report.
///
/// Wire layout (little-endian): `input_states`, `output_states`,
/// `memory_states` (u16), `analog_values` (2 x u16), `integer_values`
/// (2 x u16), `bit_index`, one reserved byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpecificData {
    pub input_states: u8,
    pub output_states: u8,
    pub memory_states: u16,
    pub analog_values: [u16; 2],
    pub integer_values: [u16; 2],
    pub bit_index: u8,
    pub reserved: u8,
}

impl DeviceSpecificData {
    pub fn encode(&self) -> [u8; DEVICE_DATA_LEN] {
        let mut out = [0u8; DEVICE_DATA_LEN];
        out[0] = self.input_states;
        out[1] = self.output_states;
        out[2..4].copy_from_slice(&self.memory_states.to_le_bytes());
        out[4..6].copy_from_slice(&self.analog_values[0].to_le_bytes());
        out[6..8].copy_from_slice(&self.analog_values[1].to_le_bytes());
        out[8..10].copy_from_slice(&self.integer_values[0].to_le_bytes());
        out[10..12].copy_from_slice(&self.integer_values[1].to_le_bytes());
        out[12] = self.bit_index;
        out[13] = self.reserved;
        out
    }

    /// `None` unless the payload is exactly [`DEVICE_DATA_LEN`] bytes.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != DEVICE_DATA_LEN {
            return None;
        }
        let word = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        Some(Self {
            input_states: payload[0],
            output_states: payload[1],
            memory_states: word(2),
            analog_values: [word(4), word(6)],
            integer_values: [word(8), word(10)],
            bit_index: payload[12],
            reserved: payload[13],
        })
    }

    /// Input channel `channel` (bit `channel` of `input_states`).
    pub fn input(&self, channel: usize) -> bool {
        channel < 8 && self.input_states & (1 << channel) != 0
    }
}

/// Physical pin access. Inputs are wired active-low with pull-ups.
pub trait PinIo: Send {
    /// Electrical level of `pin`; `true` is HIGH.
    fn read(&mut self, pin: u8) -> bool;
    fn write(&mut self, pin: u8, high: bool);
}

/// Pin bank held in memory. Unset inputs read HIGH (released).
#[derive(Debug, Default, Clone)]
pub struct MemoryPins {
    levels: HashMap<u8, bool>,
    writes: Vec<(u8, bool)>,
}

impl MemoryPins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive an input pin the way a button would: pressed pulls it LOW.
    pub fn press(&mut self, pin: u8, pressed: bool) {
        self.levels.insert(pin, !pressed);
    }

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    pub fn writes(&self) -> &[(u8, bool)] {
        &self.writes
    }
}

impl PinIo for MemoryPins {
    fn read(&mut self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(true)
    }

    fn write(&mut self, pin: u8, high: bool) {
        self.levels.insert(pin, high);
        self.writes.push((pin, high));
    }
}

/// Which half of the shared state drives local outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    /// Mirror the tree-wide input bitmaps.
    #[default]
    Inputs,
    /// Follow the root's output policy.
    Outputs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinLayout {
    pub input_pins: Vec<u8>,
    pub output_pins: Vec<u8>,
    pub pins_per_channel: usize,
    pub source: OutputSource,
}

impl Default for PinLayout {
    fn default() -> Self {
        Self {
            input_pins: vec![7, 6, 5],
            output_pins: vec![4, 3, 2],
            pins_per_channel: DEFAULT_PINS_PER_CHANNEL,
            source: OutputSource::Inputs,
        }
    }
}

impl PinLayout {
    /// Output bit mask for this device's bit index, taken from the shared
    /// words. Channel `c` fills output pins `c*N .. c*N+N` with the low bits
    /// of its word, truncated to the pins that exist.
    pub fn outputs_from_shared(&self, shared: &SharedIoState) -> u8 {
        let words = match self.source {
            OutputSource::Inputs => &shared.inputs,
            OutputSource::Outputs => &shared.outputs,
        };
        let count = self.output_pins.len().min(MAX_OUTPUT_PINS);
        let per = self.pins_per_channel.max(1);
        let mut states = 0u8;
        for (channel, word) in words.iter().enumerate().take(CHANNELS) {
            let start = channel * per;
            if start >= count {
                break;
            }
            let width = per.min(count - start);
            let mask = (1u32 << width) - 1;
            states |= ((word & mask) as u8) << start;
        }
        states
    }
}

/// Current local input/output state plus report pacing.
#[derive(Debug)]
pub struct LocalIo {
    layout: PinLayout,
    inputs: u8,
    raw_previous: u8,
    last_raw_change: Option<Instant>,
    outputs: u8,
    report_pending: bool,
    last_report: Option<Instant>,
}

impl LocalIo {
    pub fn new(mut layout: PinLayout) -> Self {
        if layout.input_pins.len() > MAX_INPUT_PINS {
            warn!(
                "{} input pins configured, keeping the first {}",
                layout.input_pins.len(),
                MAX_INPUT_PINS
            );
            layout.input_pins.truncate(MAX_INPUT_PINS);
        }
        if layout.output_pins.len() > MAX_OUTPUT_PINS {
            warn!(
                "{} output pins configured, keeping the first {}",
                layout.output_pins.len(),
                MAX_OUTPUT_PINS
            );
            layout.output_pins.truncate(MAX_OUTPUT_PINS);
        }
        info!(
            "Local I/O: {} inputs {:?}, {} outputs {:?}",
            layout.input_pins.len(),
            layout.input_pins,
            layout.output_pins.len(),
            layout.output_pins
        );
        Self {
            layout,
            inputs: 0,
            raw_previous: 0,
            last_raw_change: None,
            outputs: 0,
            report_pending: false,
            last_report: None,
        }
    }

    pub fn layout(&self) -> &PinLayout {
        &self.layout
    }

    pub fn inputs(&self) -> u8 {
        self.inputs
    }

    pub fn outputs(&self) -> u8 {
        self.outputs
    }

    fn read_raw(&self, pins: &mut dyn PinIo) -> u8 {
        self.layout
            .input_pins
            .iter()
            .enumerate()
            .filter(|(_, pin)| !pins.read(**pin))
            .fold(0u8, |acc, (i, _)| acc | (1 << i))
    }

    /// Sample the input pins. A new state is accepted once it has been
    /// stable for [`DEBOUNCE`]; returns it when it differs from the last one.
    /// Without input pins nothing is scanned and injected states stand.
    pub fn scan(&mut self, pins: &mut dyn PinIo, now: Instant) -> Option<u8> {
        if self.layout.input_pins.is_empty() {
            return None;
        }
        let raw = self.read_raw(pins);
        if raw != self.raw_previous || self.last_raw_change.is_none() {
            self.last_raw_change = Some(now);
            self.raw_previous = raw;
        }
        let stable = self
            .last_raw_change
            .map(|t| now.duration_since(t) >= DEBOUNCE)
            .unwrap_or(false);
        if stable && raw != self.inputs {
            Some(self.accept_inputs(raw))
        } else {
            None
        }
    }

    /// Inject an input state directly (simulation, tests). Returns true on change.
    pub fn set_inputs(&mut self, states: u8) -> bool {
        if states == self.inputs {
            return false;
        }
        self.raw_previous = states;
        self.accept_inputs(states);
        true
    }

    fn accept_inputs(&mut self, states: u8) -> u8 {
        debug!("Input change detected: {:08b} (was {:08b})", states, self.inputs);
        self.inputs = states;
        self.report_pending = true;
        states
    }

    /// Consume the pending-change flag if the rate limit allows a report now.
    pub fn take_report_due(&mut self, now: Instant, rate_limit: Duration) -> bool {
        if !self.report_pending {
            return false;
        }
        if let Some(last) = self.last_report {
            if now.duration_since(last) < rate_limit {
                return false;
            }
        }
        self.report_pending = false;
        self.last_report = Some(now);
        true
    }

    pub fn report_pending(&self) -> bool {
        self.report_pending
    }

    /// Drive every configured output pin from `states` (bit i -> pin i).
    pub fn write_outputs(&mut self, states: u8, pins: &mut dyn PinIo) {
        for (i, pin) in self.layout.output_pins.iter().enumerate() {
            pins.write(*pin, states & (1 << i) != 0);
        }
        if states != self.outputs {
            debug!("Outputs updated: {:08b} (was {:08b})", states, self.outputs);
        }
        self.outputs = states;
    }

    pub fn apply_shared(&mut self, shared: &SharedIoState, pins: &mut dyn PinIo) -> u8 {
        let states = self.layout.outputs_from_shared(shared);
        self.write_outputs(states, pins);
        states
    }

    pub fn device_data(&self, bit_index: u8) -> DeviceSpecificData {
        DeviceSpecificData {
            input_states: self.inputs,
            output_states: self.outputs,
            bit_index,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_data_wire_layout() {
        let data = DeviceSpecificData {
            input_states: 0b101,
            output_states: 0x02,
            memory_states: 0x1234,
            analog_values: [0x0A0B, 1],
            integer_values: [2, 0xFFFF],
            bit_index: 5,
            reserved: 0,
        };
        let bytes = data.encode();
        assert_eq!(
            bytes,
            [0x05, 0x02, 0x34, 0x12, 0x0B, 0x0A, 1, 0, 2, 0, 0xFF, 0xFF, 5, 0]
        );
        assert_eq!(DeviceSpecificData::decode(&bytes), Some(data));
        assert_eq!(DeviceSpecificData::decode(&bytes[..13]), None);
        assert!(data.input(0) && !data.input(1) && data.input(2));
    }

    #[test]
    fn three_outputs_take_channel_zero_only() {
        let layout = PinLayout::default();
        let shared = SharedIoState {
            inputs: [0b1111_0101, 0b111, 0b1],
            outputs: [0, 0, 0],
        };
        assert_eq!(layout.outputs_from_shared(&shared), 0b101);
    }

    #[test]
    fn eight_outputs_span_all_channels() {
        let layout = PinLayout {
            output_pins: (10..18).collect(),
            ..PinLayout::default()
        };
        let shared = SharedIoState {
            inputs: [0b001, 0b110, 0b111],
            outputs: [0, 0, 0],
        };
        // channel 2 only has pins 6 and 7 left
        assert_eq!(layout.outputs_from_shared(&shared), 0b1111_0001);

        let policy_driven = PinLayout {
            source: OutputSource::Outputs,
            ..PinLayout::default()
        };
        let shared = SharedIoState {
            inputs: [0b111, 0, 0],
            outputs: [0b001, 0, 0],
        };
        assert_eq!(policy_driven.outputs_from_shared(&shared), 0b001);
    }

    #[test]
    fn scan_debounces_before_accepting() {
        let mut io = LocalIo::new(PinLayout::default());
        let mut pins = MemoryPins::new();
        let t0 = Instant::now();
        assert_eq!(io.scan(&mut pins, t0), None);

        pins.press(6, true);
        assert_eq!(io.scan(&mut pins, t0 + Duration::from_millis(10)), None);
        assert_eq!(io.scan(&mut pins, t0 + Duration::from_millis(30)), None);
        assert_eq!(io.scan(&mut pins, t0 + Duration::from_millis(70)), Some(0b010));
        assert_eq!(io.scan(&mut pins, t0 + Duration::from_millis(200)), None);
        assert_eq!(io.inputs(), 0b010);
    }

    #[test]
    fn reports_are_rate_limited() {
        let mut io = LocalIo::new(PinLayout::default());
        let t0 = Instant::now();
        let limit = Duration::from_millis(50);
        assert!(!io.take_report_due(t0, limit));
        assert!(io.set_inputs(1));
        assert!(!io.set_inputs(1));
        assert!(io.take_report_due(t0, limit));
        assert!(io.set_inputs(3));
        assert!(!io.take_report_due(t0 + Duration::from_millis(20), limit));
        assert!(io.report_pending());
        assert!(io.take_report_due(t0 + Duration::from_millis(60), limit));
    }

    #[test]
    fn write_outputs_drives_pins_in_order() {
        let mut io = LocalIo::new(PinLayout::default());
        let mut pins = MemoryPins::new();
        io.write_outputs(0b110, &mut pins);
        assert_eq!(pins.writes(), &[(4, false), (3, true), (2, true)]);
        assert_eq!(io.outputs(), 0b110);
        assert_eq!(io.device_data(9).output_states, 0b110);
        assert_eq!(io.device_data(9).bit_index, 9);
    }
}
