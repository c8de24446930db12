//! Distributed I/O engine.
//!
//! On the root it folds every known device's inputs into the shared bitmaps,
//! runs the output policy, and hands back a new state only when something
//! changed. On every other node it applies the state it receives from its
//! parent to the local outputs.
use log::{debug, error, info};

use super::device::{DeviceSpecificData, LocalIo, PinIo};
use super::policy::{AndPolicy, OutputPolicy};
use super::shared::{BitChange, SharedIoState, CHANNELS};
use crate::tree::aggregate::AggregationTable;
use crate::tree::identity::{is_valid_bit_index, Identity};

pub struct IoEngine {
    policy: Box<dyn OutputPolicy>,
    /// Last state this root broadcast. `None` until the first broadcast.
    last_broadcast: Option<SharedIoState>,
    /// Last state applied locally, received or computed.
    mirror: SharedIoState,
}

impl Default for IoEngine {
    fn default() -> Self {
        Self::new(Box::new(AndPolicy))
    }
}

impl std::fmt::Debug for IoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEngine")
            .field("policy", &self.policy.name())
            .field("last_broadcast", &self.last_broadcast)
            .field("mirror", &self.mirror)
            .finish()
    }
}

fn fold_device(inputs: &mut [u32; CHANNELS], hid: u16, data: &DeviceSpecificData) {
    if !is_valid_bit_index(data.bit_index) {
        error!(
            "Device {} has invalid bit index {}; skipped from shared state",
            hid, data.bit_index
        );
        return;
    }
    for (channel, word) in inputs.iter_mut().enumerate() {
        if data.input(channel) {
            *word |= 1 << data.bit_index;
        }
    }
}

impl IoEngine {
    pub fn new(policy: Box<dyn OutputPolicy>) -> Self {
        Self {
            policy,
            last_broadcast: None,
            mirror: SharedIoState::default(),
        }
    }

    pub fn set_policy(&mut self, policy: Box<dyn OutputPolicy>) {
        info!("Output policy set to '{}'", policy.name());
        self.policy = policy;
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn shared_state(&self) -> &SharedIoState {
        &self.mirror
    }

    pub fn last_broadcast(&self) -> Option<&SharedIoState> {
        self.last_broadcast.as_ref()
    }

    /// Pure function of its arguments: the root's own data (when it has a
    /// bit index) plus every aggregated device, then the policy.
    pub fn compute_shared_state(
        &self,
        identity: &Identity,
        own: &DeviceSpecificData,
        table: &AggregationTable,
    ) -> SharedIoState {
        let mut inputs = [0u32; CHANNELS];
        if identity.is_fully_configured() {
            fold_device(&mut inputs, identity.raw_hid(), own);
        }
        for device in table.iter() {
            fold_device(&mut inputs, device.hid, &device.data);
        }
        SharedIoState {
            inputs,
            outputs: self.policy.compute_outputs(&inputs),
        }
    }

    /// Root only. Returns the state to flood when it differs in any bit from
    /// the previous broadcast; the root's own outputs follow it as well.
    pub fn maybe_recompute_and_broadcast(
        &mut self,
        identity: &Identity,
        table: &AggregationTable,
        local: &mut LocalIo,
        pins: &mut dyn PinIo,
    ) -> Option<SharedIoState> {
        if !identity.is_root() {
            debug!("Shared state recompute skipped: not the root");
            return None;
        }
        let own = local.device_data(identity.bit_index().unwrap_or(u8::MAX));
        let state = self.compute_shared_state(identity, &own, table);
        if self.last_broadcast == Some(state) {
            return None;
        }
        info!("Shared state changed: {}", state);
        self.last_broadcast = Some(state);
        self.apply(state, local, pins);
        Some(state)
    }

    /// Non-root side of a flood: mirror the state and drive the pins.
    pub fn apply_received_shared_state(
        &mut self,
        state: SharedIoState,
        local: &mut LocalIo,
        pins: &mut dyn PinIo,
    ) -> Vec<BitChange> {
        debug!("Shared state received: {}", state);
        self.apply(state, local, pins)
    }

    fn apply(&mut self, state: SharedIoState, local: &mut LocalIo, pins: &mut dyn PinIo) -> Vec<BitChange> {
        let changes = self.mirror.changes_to(&state);
        for change in &changes {
            info!(target: "io", "{}", change);
        }
        self.mirror = state;
        local.apply_shared(&state, pins);
        changes
    }

    /// Forget the last broadcast so the next recompute always floods.
    pub fn force_rebroadcast(&mut self) {
        self.last_broadcast = None;
    }

    /// This node's bit on input channel `channel` in the mirrored state.
    pub fn my_bit_state(&self, identity: &Identity, channel: usize) -> bool {
        identity
            .bit_index()
            .map(|bit| self.mirror.input_bit(channel, bit))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::{MemoryPins, PinLayout};
    use crate::io::policy::MirrorPolicy;

    fn report(inputs: u8, bit: u8) -> DeviceSpecificData {
        DeviceSpecificData {
            input_states: inputs,
            bit_index: bit,
            ..Default::default()
        }
    }

    #[test]
    fn single_device_sets_its_bit() {
        let engine = IoEngine::default();
        let root = Identity::with(1, None);
        let mut table = AggregationTable::default();
        table.upsert(12, report(0b001, 5));
        let state = engine.compute_shared_state(&root, &DeviceSpecificData::default(), &table);
        assert_eq!(state.inputs, [0x20, 0, 0]);
        assert_eq!(state.outputs, [0, 0, 0]);
    }

    #[test]
    fn compute_is_deterministic_and_bit_local() {
        let engine = IoEngine::new(Box::new(MirrorPolicy));
        let root = Identity::with(1, Some(0));
        let own = report(0b100, 0);
        let mut table = AggregationTable::default();
        table.upsert(12, report(0b011, 5));
        table.upsert(13, report(0b010, 31));
        let a = engine.compute_shared_state(&root, &own, &table);
        let b = engine.compute_shared_state(&root, &own, &table);
        assert_eq!(a, b);
        assert_eq!(a.inputs, [1 << 5, (1 << 5) | (1 << 31), 1]);

        table.upsert(13, report(0b011, 31));
        let c = engine.compute_shared_state(&root, &own, &table);
        assert_eq!(c.inputs[0] ^ a.inputs[0], 1 << 31);
        assert_eq!(c.inputs[1], a.inputs[1]);
        assert_eq!(c.inputs[2], a.inputs[2]);
    }

    #[test]
    fn invalid_bit_index_is_skipped() {
        let engine = IoEngine::default();
        let root = Identity::with(1, None);
        let mut table = AggregationTable::default();
        table.upsert(12, report(0b111, 40));
        table.upsert(13, report(0b001, 2));
        let state = engine.compute_shared_state(&root, &report(0b111, 0), &table);
        // root has no bit index so its own inputs do not count
        assert_eq!(state.inputs, [0b100, 0, 0]);
    }

    #[test]
    fn recompute_broadcasts_once_per_change() {
        let mut engine = IoEngine::default();
        let root = Identity::with(1, Some(0));
        let mut table = AggregationTable::default();
        let mut local = LocalIo::new(PinLayout::default());
        let mut pins = MemoryPins::new();

        assert!(engine
            .maybe_recompute_and_broadcast(&root, &table, &mut local, &mut pins)
            .is_some());
        assert!(engine
            .maybe_recompute_and_broadcast(&root, &table, &mut local, &mut pins)
            .is_none());

        local.set_inputs(0b001);
        table.upsert(12, report(0b001, 1));
        let state = engine
            .maybe_recompute_and_broadcast(&root, &table, &mut local, &mut pins)
            .unwrap();
        assert_eq!(state.inputs[0], 0b11);
        assert_eq!(state.outputs[0], 1);
        // root mirrors inputs onto its own first three pins
        assert_eq!(local.outputs(), 0b011);
        assert_eq!(engine.shared_state(), &state);
        assert!(engine.my_bit_state(&root, 0));
    }

    #[test]
    fn non_root_never_recomputes() {
        let mut engine = IoEngine::default();
        let node = Identity::with(12, Some(3));
        let mut local = LocalIo::new(PinLayout::default());
        let mut pins = MemoryPins::new();
        assert!(engine
            .maybe_recompute_and_broadcast(&node, &AggregationTable::default(), &mut local, &mut pins)
            .is_none());
    }

    #[test]
    fn apply_received_reports_flipped_bits() {
        let mut engine = IoEngine::default();
        let mut local = LocalIo::new(PinLayout::default());
        let mut pins = MemoryPins::new();
        let first = SharedIoState {
            inputs: [0b100, 0, 0],
            outputs: [0, 0, 0],
        };
        let changes = engine.apply_received_shared_state(first, &mut local, &mut pins);
        assert_eq!(changes.len(), 1);
        assert_eq!(local.outputs(), 0b100);
        assert_eq!(pins.level(2), Some(true));

        let again = engine.apply_received_shared_state(first, &mut local, &mut pins);
        assert!(again.is_empty());
    }
}
