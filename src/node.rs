//! A tree network node.
//!
//! [`TreeNode`] owns everything one station needs: identity, statistics, the
//! root's device table, the I/O engine, local pins and the radio. Received
//! frames and local events are fed to it by a single task ([`TreeNode::run`]),
//! so none of that state needs a lock. The statistics are atomics shared with
//! the radio's send-completion callback.
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::io::device::{LocalIo, PinIo, PinLayout};
use crate::io::engine::IoEngine;
use crate::io::policy::{self, AndPolicy};
use crate::io::shared::SharedIoState;
use crate::logutil::hex_preview;
use crate::metrics::{NetworkStats, SequenceCounter, Snapshot};
use crate::radio::{Radio, RxEvent};
use crate::tree::aggregate::{AggregatedDevice, AggregationTable, DEFAULT_MAX_DEVICES};
use crate::tree::dispatch::{encode_shared_update, Dispatched, Dispatcher};
use crate::tree::frame::{self, MessageType, MAX_PAYLOAD_LEN};
use crate::tree::hid::{BROADCAST_HID, ROOT_HID, UNCONFIGURED_HID};
use crate::tree::identity::{Identity, IdentityStore, StoreError};

/// Pattern written by [`TreeNode::send_test_command`].
pub const TEST_PATTERN: u8 = 0x55;

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub layout: PinLayout,
    pub report_rate_limit: Duration,
    pub auto_report: bool,
    pub auto_report_interval: Duration,
    pub max_devices: usize,
    pub policy: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            layout: PinLayout::default(),
            report_rate_limit: Duration::from_millis(50),
            auto_report: false,
            auto_report_interval: Duration::from_secs(5),
            max_devices: DEFAULT_MAX_DEVICES,
            policy: "and".to_string(),
        }
    }
}

/// Events a node's task accepts besides received frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    SetInputs(u8),
    SendDataReport,
    SendTestCommand,
    SetOutputs { target: u16, states: u8 },
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub hid: u16,
    pub bit_index: u8,
    pub input_states: u8,
    pub output_states: u8,
    pub seconds_since_seen: i64,
}

impl DeviceStatus {
    fn from_entry(entry: &AggregatedDevice, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            hid: entry.hid,
            bit_index: entry.data.bit_index,
            input_states: entry.data.input_states,
            output_states: entry.data.output_states,
            seconds_since_seen: entry.seconds_since_seen(now),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub hid: u16,
    pub parent: u16,
    pub depth: u8,
    pub bit_index: Option<u8>,
    pub is_root: bool,
    pub status: String,
    pub auto_report: bool,
    pub policy: &'static str,
    pub inputs: u8,
    pub outputs: u8,
    pub shared: SharedIoState,
    pub shared_text: String,
    pub devices: Vec<DeviceStatus>,
    pub stats: Snapshot,
}

pub struct TreeNode<R: Radio, P: PinIo> {
    identity: Identity,
    store: Arc<dyn IdentityStore>,
    stats: Arc<NetworkStats>,
    seq: SequenceCounter,
    table: AggregationTable,
    engine: IoEngine,
    local: LocalIo,
    pins: P,
    radio: R,
    settings: NodeSettings,
    auto_report: bool,
    last_auto_report: Option<Instant>,
}

impl<R: Radio, P: PinIo> TreeNode<R, P> {
    /// Load the persisted identity and wire the radio's completion callback
    /// into the statistics.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        mut radio: R,
        pins: P,
        settings: NodeSettings,
    ) -> Result<Self, StoreError> {
        let identity = Identity::load(store.as_ref())?;
        let stats = Arc::new(NetworkStats::new());
        let completion = stats.clone();
        radio.on_send_complete(Arc::new(move |ok| completion.record_send_result(ok)));

        let policy = policy::by_name(&settings.policy).unwrap_or_else(|| {
            warn!("Unknown output policy '{}', using 'and'", settings.policy);
            Box::new(AndPolicy)
        });
        let mut node = Self {
            identity,
            store,
            stats,
            seq: SequenceCounter::new(),
            table: AggregationTable::with_capacity(settings.max_devices),
            engine: IoEngine::new(policy),
            local: LocalIo::new(settings.layout.clone()),
            pins,
            radio,
            auto_report: false,
            last_auto_report: None,
            settings,
        };
        if node.settings.auto_report {
            node.enable_auto_reporting(true);
        }
        info!("Tree node ready: {}", node.identity.status_line());
        Ok(node)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn stats(&self) -> Arc<NetworkStats> {
        self.stats.clone()
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn local(&self) -> &LocalIo {
        &self.local
    }

    pub fn shared_state(&self) -> &SharedIoState {
        self.engine.shared_state()
    }

    /// Root only; other nodes always report zero.
    pub fn device_count(&self) -> usize {
        if self.identity.is_root() {
            self.table.len()
        } else {
            0
        }
    }

    /// Root only.
    pub fn device(&self, hid: u16) -> Option<&AggregatedDevice> {
        if self.identity.is_root() {
            self.table.get(hid)
        } else {
            None
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &AggregatedDevice> {
        let root = self.identity.is_root();
        self.table.iter().filter(move |_| root)
    }

    pub fn my_bit_state(&self, channel: usize) -> bool {
        self.engine.my_bit_state(&self.identity, channel)
    }

    // identity management

    pub fn configure_hid(&mut self, hid: u16) -> Result<bool, StoreError> {
        let changed = self.identity.configure_hid(hid, self.store.as_ref())?;
        if changed {
            self.engine.force_rebroadcast();
            if self.auto_report && self.identity.is_root() {
                info!("Auto reporting disabled: node is now root");
                self.auto_report = false;
            }
        }
        Ok(changed)
    }

    pub fn configure_bit_index(&mut self, bit: u8) -> Result<bool, StoreError> {
        self.identity.configure_bit_index(bit, self.store.as_ref())
    }

    pub fn clear_hid(&mut self) -> Result<(), StoreError> {
        self.auto_report = false;
        self.identity.clear_hid(self.store.as_ref())
    }

    pub fn clear_bit_index(&mut self) -> Result<(), StoreError> {
        self.identity.clear_bit_index(self.store.as_ref())
    }

    pub fn clear_identity(&mut self) -> Result<(), StoreError> {
        self.auto_report = false;
        self.identity.clear_all(self.store.as_ref())
    }

    pub fn clear_aggregated_data(&mut self) {
        self.table.clear();
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
        info!("Network statistics reset");
    }

    // receive path

    /// Run one received frame through dispatch and put any relays or floods
    /// it produced on the air.
    pub fn handle_received(&mut self, event: RxEvent) -> Dispatched {
        let result = Dispatcher {
            identity: &self.identity,
            stats: &self.stats,
            seq: &self.seq,
            table: &mut self.table,
            engine: &mut self.engine,
            local: &mut self.local,
            pins: &mut self.pins,
        }
        .handle(&event.bytes, event.sender, event.rssi);
        for bytes in &result.outbound {
            self.transmit(bytes);
        }
        result
    }

    // send path

    fn transmit(&mut self, bytes: &[u8]) -> bool {
        match self.radio.send_broadcast(bytes) {
            Ok(()) => {
                trace!("TX {}", hex_preview(bytes));
                true
            }
            Err(e) => {
                warn!("Send failed: {}", e);
                self.stats.record_send_result(false);
                false
            }
        }
    }

    fn send_frame(&mut self, dest: u16, msg_type: MessageType, payload: &[u8]) -> bool {
        let Some(hid) = self.identity.hid() else {
            warn!("Cannot send {:?}: HID not configured", msg_type);
            return false;
        };
        if payload.len() > MAX_PAYLOAD_LEN {
            error!(
                "Cannot send {:?}: payload of {} bytes exceeds {}",
                msg_type,
                payload.len(),
                MAX_PAYLOAD_LEN
            );
            return false;
        }
        match frame::encode(dest, hid.get(), msg_type, self.seq.next(), payload) {
            Ok(bytes) => self.transmit(&bytes),
            Err(e) => {
                error!("Failed to create {:?} frame: {}", msg_type, e);
                false
            }
        }
    }

    /// Report local state to the root. Refused on the root itself.
    pub fn send_data_report(&mut self) -> bool {
        if !self.identity.is_configured() {
            warn!("Data report not sent: HID not configured");
            return false;
        }
        if self.identity.is_root() {
            debug!("Root does not send data reports");
            return false;
        }
        let bit = self.identity.bit_index().unwrap_or(u8::MAX);
        let data = self.local.device_data(bit);
        let sent = self.send_frame(ROOT_HID, MessageType::DataReport, &data.encode());
        if sent {
            debug!(
                "Data report sent: in={:08b} out={:08b} bit={}",
                data.input_states, data.output_states, bit
            );
        }
        sent
    }

    pub fn send_command(&mut self, target: u16, msg_type: MessageType, payload: &[u8]) -> bool {
        if target == UNCONFIGURED_HID {
            warn!("Refusing to send {:?} to the unconfigured HID", msg_type);
            return false;
        }
        let sent = self.send_frame(target, msg_type, payload);
        if sent {
            info!("Command {:?} sent to {}", msg_type, target);
        }
        sent
    }

    pub fn send_set_outputs(&mut self, target: u16, states: u8) -> bool {
        self.send_command(target, MessageType::SetOutputs, &[states])
    }

    /// Set-outputs with [`TEST_PATTERN`] to this node's first child.
    pub fn send_test_command(&mut self) -> bool {
        let Some(child) = self.identity.hid().and_then(|h| h.child(1)) else {
            warn!("Test command not sent: HID not configured or no room for children");
            return false;
        };
        self.send_set_outputs(child.get(), TEST_PATTERN)
    }

    pub fn send_ack(&mut self, target: u16, seq: u8) -> bool {
        self.send_command(target, MessageType::Ack, &[seq])
    }

    pub fn send_nack(&mut self, target: u16, seq: u8, reason: u8) -> bool {
        self.send_command(target, MessageType::Nack, &[seq, reason])
    }

    /// Generic broadcast to [`BROADCAST_HID`]. Routing, not the destination,
    /// decides who acts on it.
    pub fn send_broadcast(&mut self, msg_type: MessageType, payload: &[u8]) -> bool {
        self.send_frame(BROADCAST_HID, msg_type, payload)
    }

    /// Root only: recompute the shared state and flood it if it changed.
    pub fn recompute_and_broadcast(&mut self) -> bool {
        let Some(state) = self.engine.maybe_recompute_and_broadcast(
            &self.identity,
            &self.table,
            &mut self.local,
            &mut self.pins,
        ) else {
            return false;
        };
        match encode_shared_update(&self.identity, &self.seq, &state) {
            Some(bytes) => self.transmit(&bytes),
            None => false,
        }
    }

    // local I/O and timers

    /// Inject an input state (simulation, tests). Returns true on change.
    pub fn set_local_inputs(&mut self, states: u8) -> bool {
        if !self.local.set_inputs(states) {
            return false;
        }
        self.on_input_change(Instant::now());
        true
    }

    fn on_input_change(&mut self, now: Instant) {
        if self.identity.is_root() {
            self.local.take_report_due(now, Duration::ZERO);
            self.recompute_and_broadcast();
        } else {
            self.flush_report(now);
        }
    }

    fn flush_report(&mut self, now: Instant) -> bool {
        if !self.identity.is_configured() || self.identity.is_root() {
            return false;
        }
        if self
            .local
            .take_report_due(now, self.settings.report_rate_limit)
        {
            self.send_data_report()
        } else {
            false
        }
    }

    /// Refused on the root and on unconfigured nodes.
    pub fn enable_auto_reporting(&mut self, enable: bool) -> bool {
        if enable && (!self.identity.is_configured() || self.identity.is_root()) {
            warn!("Cannot enable auto reporting: root node or HID not configured");
            return false;
        }
        self.auto_report = enable;
        self.last_auto_report = Some(Instant::now());
        info!("Auto reporting {}", if enable { "enabled" } else { "disabled" });
        true
    }

    pub fn auto_reporting(&self) -> bool {
        self.auto_report
    }

    /// Periodic work: scan inputs, send a pending report once the rate
    /// limit allows it, and send the interval report when it is due.
    pub fn tick(&mut self, now: Instant) {
        if self.local.scan(&mut self.pins, now).is_some() {
            self.on_input_change(now);
        } else {
            self.flush_report(now);
        }
        if !self.auto_report || self.identity.is_root() || !self.identity.is_configured() {
            return;
        }
        let due = self
            .last_auto_report
            .map(|t| now.duration_since(t) >= self.settings.auto_report_interval)
            .unwrap_or(true);
        if due {
            self.last_auto_report = Some(now);
            if self.send_data_report() {
                trace!("Auto data report sent to parent {}", self.identity.parent_hid());
            }
        }
    }

    fn apply_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SetInputs(states) => {
                self.set_local_inputs(states);
            }
            NodeCommand::SendDataReport => {
                self.send_data_report();
            }
            NodeCommand::SendTestCommand => {
                self.send_test_command();
            }
            NodeCommand::SetOutputs { target, states } => {
                self.send_set_outputs(target, states);
            }
            NodeCommand::Shutdown => {}
        }
    }

    pub fn status(&self) -> NodeStatus {
        let now = chrono::Utc::now();
        let shared = *self.engine.shared_state();
        NodeStatus {
            hid: self.identity.raw_hid(),
            parent: self.identity.parent_hid(),
            depth: self.identity.tree_depth(),
            bit_index: self.identity.bit_index(),
            is_root: self.identity.is_root(),
            status: self.identity.status_line(),
            auto_report: self.auto_report,
            policy: self.engine.policy_name(),
            inputs: self.local.inputs(),
            outputs: self.local.outputs(),
            shared,
            shared_text: shared.to_string(),
            devices: self
                .devices()
                .map(|d| DeviceStatus::from_entry(d, now))
                .collect(),
            stats: self.stats.snapshot(),
        }
    }

    /// Drive the node until [`NodeCommand::Shutdown`] or until both queues
    /// close. The receive queue is the only producer of frames; this task is
    /// their only consumer.
    pub async fn run(
        mut self,
        mut frames: mpsc::UnboundedReceiver<RxEvent>,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
        poll: Duration,
    ) -> Self {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_open = true;
        loop {
            tokio::select! {
                event = frames.recv(), if frames_open => match event {
                    Some(event) => {
                        self.handle_received(event);
                    }
                    None => {
                        debug!("Receive queue closed");
                        frames_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.apply_command(command),
                },
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
        info!("Node {} stopping: {}", self.identity.raw_hid(), self.stats.snapshot().summary());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::{DeviceSpecificData, MemoryPins};
    use crate::radio::{station_address, RecordingRadio};
    use crate::tree::frame::decode;
    use crate::tree::identity::MemoryIdentityStore;

    type TestNode = TreeNode<RecordingRadio, MemoryPins>;

    fn node(hid: Option<u16>, bit: Option<u8>) -> (TestNode, RecordingRadio) {
        let store = Arc::new(MemoryIdentityStore::new());
        if let Some(h) = hid {
            store.save_hid(h).unwrap();
        }
        if let Some(b) = bit {
            store.save_bit_index(b).unwrap();
        }
        let radio = RecordingRadio::new(station_address(hid.unwrap_or(0)));
        let probe = radio.clone();
        let node = TreeNode::new(store, radio, MemoryPins::new(), NodeSettings::default()).unwrap();
        (node, probe)
    }

    #[test]
    fn unconfigured_node_sends_nothing() {
        let (mut n, radio) = node(None, None);
        assert!(!n.send_data_report());
        assert!(!n.send_set_outputs(12, 1));
        assert!(!n.send_test_command());
        assert!(!n.send_broadcast(MessageType::Ack, &[]));
        assert!(!n.enable_auto_reporting(true));
        assert!(radio.sent().is_empty());
        assert_eq!(n.seq.current(), 0);
    }

    #[test]
    fn data_report_goes_to_root_with_bit_index() {
        let (mut n, radio) = node(Some(121), Some(5));
        n.set_local_inputs(0b011);
        let sent = radio.take_sent();
        assert_eq!(sent.len(), 1);
        let f = decode(&sent[0]).unwrap();
        assert_eq!((f.dest, f.src, f.broadcaster, f.seq), (1, 121, 121, 1));
        let data = DeviceSpecificData::decode(&f.payload).unwrap();
        assert_eq!((data.input_states, data.bit_index), (0b011, 5));
        assert_eq!(n.stats.snapshot().sent, 1);
    }

    #[test]
    fn reports_respect_rate_limit() {
        let (mut n, radio) = node(Some(12), Some(1));
        assert!(n.set_local_inputs(1));
        assert!(n.set_local_inputs(0));
        assert_eq!(radio.take_sent().len(), 1);
        n.tick(Instant::now() + Duration::from_millis(100));
        let sent = radio.take_sent();
        assert_eq!(sent.len(), 1);
        let data = DeviceSpecificData::decode(&decode(&sent[0]).unwrap().payload).unwrap();
        assert_eq!(data.input_states, 0);
    }

    #[test]
    fn root_floods_on_local_change_only() {
        let (mut n, radio) = node(Some(1), Some(0));
        assert!(!n.send_data_report());
        assert!(n.set_local_inputs(0b001));
        let sent = radio.take_sent();
        assert_eq!(sent.len(), 1);
        let f = decode(&sent[0]).unwrap();
        assert_eq!(f.msg_type, MessageType::DistributedIoUpdate);
        assert_eq!(SharedIoState::from_payload(&f.payload).unwrap().inputs, [1, 0, 0]);
        assert!(!n.recompute_and_broadcast());
        assert!(radio.sent().is_empty());
    }

    #[test]
    fn command_helpers_build_expected_frames() {
        let (mut n, radio) = node(Some(12), Some(1));
        assert!(n.send_test_command());
        assert!(n.send_ack(1, 9));
        assert!(n.send_nack(1, 9, 3));
        assert!(n.send_broadcast(MessageType::Unknown(0x40), b"hi"));
        assert!(!n.send_command(0, MessageType::SetOutputs, &[1]));
        assert!(!n.send_broadcast(MessageType::Unknown(0x40), &[0; 244]));
        let frames: Vec<_> = radio.sent().iter().map(|b| decode(b).unwrap()).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!((frames[0].dest, frames[0].payload.clone()), (121, vec![TEST_PATTERN]));
        assert_eq!(frames[1].payload, vec![9]);
        assert_eq!(frames[2].payload, vec![9, 3]);
        assert_eq!(frames[3].dest, BROADCAST_HID);
        let seqs: Vec<u8> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn auto_report_interval() {
        let (mut n, radio) = node(Some(12), Some(1));
        assert!(n.enable_auto_reporting(true));
        let start = Instant::now();
        n.tick(start + Duration::from_secs(1));
        assert!(radio.sent().is_empty());
        n.tick(start + Duration::from_secs(6));
        assert_eq!(radio.take_sent().len(), 1);
        n.tick(start + Duration::from_secs(7));
        assert!(radio.sent().is_empty());

        let (mut root, _) = node(Some(1), Some(0));
        assert!(!root.enable_auto_reporting(true));
    }

    #[test]
    fn relays_go_out_on_the_radio() {
        let (mut n, radio) = node(Some(12), Some(1));
        let raw = frame::encode(1, 121, MessageType::DataReport, 4, &DeviceSpecificData::default().encode()).unwrap();
        n.handle_received(RxEvent {
            bytes: raw,
            sender: station_address(121),
            rssi: -60,
        });
        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0]).unwrap().broadcaster, 12);
        assert_eq!(n.status().stats.forwarded, 1);
    }

    #[test]
    fn failed_completion_is_counted() {
        let store = Arc::new(MemoryIdentityStore::new());
        store.save_hid(12).unwrap();
        let mut n = TreeNode::new(
            store,
            RecordingRadio::failing(station_address(12)),
            MemoryPins::new(),
            NodeSettings::default(),
        )
        .unwrap();
        assert!(n.send_data_report());
        let snap = n.stats().snapshot();
        assert_eq!((snap.sent, snap.send_failures), (0, 1));
    }

    #[test]
    fn status_reflects_identity_and_devices() {
        let (mut n, _) = node(Some(1), None);
        let report = DeviceSpecificData {
            input_states: 1,
            bit_index: 5,
            ..Default::default()
        };
        let raw = frame::encode(1, 12, MessageType::DataReport, 1, &report.encode()).unwrap();
        n.handle_received(RxEvent {
            bytes: raw,
            sender: station_address(12),
            rssi: -42,
        });
        let status = n.status();
        assert!(status.is_root);
        assert_eq!(status.status, "HID:1 (ROOT)");
        assert_eq!(status.devices.len(), 1);
        assert_eq!(status.devices[0].hid, 12);
        assert_eq!(status.shared.inputs, [0x20, 0, 0]);
        assert_eq!(n.device_count(), 1);
        assert!(n.device(12).is_some());
        n.clear_aggregated_data();
        assert_eq!(n.device_count(), 0);
    }
}
