//! Message dispatch for received frames.
//!
//! Each raw frame is validated, routed, handed to its type handler when it is
//! for this node, and relayed when routing says so. Nothing is kept between
//! frames apart from the state the handlers mutate. Every validated frame ends
//! in exactly one statistics bucket, except floods which count as both
//! processed and forwarded.
use log::{debug, error, info, trace, warn};
use serde::Serialize;

use super::aggregate::{AggregationTable, Upsert};
use super::frame::{self, Frame, MessageType};
use super::hid::{is_parent_child, BROADCAST_HID};
use super::identity::Identity;
use super::routing::{RouteDecision, Router};
use crate::io::device::{DeviceSpecificData, LocalIo, PinIo};
use crate::io::engine::IoEngine;
use crate::io::shared::SharedIoState;
use crate::logutil::hex_preview;
use crate::metrics::{NetworkStats, SequenceCounter};

/// Where a received frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Processed,
    Forwarded,
    ProcessedAndForwarded,
    Ignored,
    SecurityViolation,
    /// Failed validation; counted as ignored.
    Invalid,
}

#[derive(Debug, Default)]
pub struct Dispatched {
    pub outcome: Option<Outcome>,
    pub frame: Option<Frame>,
    /// Frames to put on the air, in order: relays first, then anything the
    /// handlers produced.
    pub outbound: Vec<Vec<u8>>,
}

impl Dispatched {
    fn finish(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

enum Handled {
    Done,
    Violation,
    Dropped,
}

/// Borrowed view of the node state a received frame may touch.
pub struct Dispatcher<'a> {
    pub identity: &'a Identity,
    pub stats: &'a NetworkStats,
    pub seq: &'a SequenceCounter,
    pub table: &'a mut AggregationTable,
    pub engine: &'a mut IoEngine,
    pub local: &'a mut LocalIo,
    pub pins: &'a mut dyn PinIo,
}

impl Dispatcher<'_> {
    pub fn handle(&mut self, raw: &[u8], sender: [u8; 6], rssi: i32) -> Dispatched {
        let mut out = Dispatched::default();
        let frame = match frame::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                debug!("Dropping invalid frame ({}): {}", e, hex_preview(raw));
                self.stats.inc_ignored();
                return out.finish(Outcome::Invalid);
            }
        };
        self.stats.inc_received();
        self.stats.record_link(sender, rssi);
        trace!(
            "Tree message: type={:?} from={} to={} via={} seq={}",
            frame.msg_type,
            frame.src,
            frame.dest,
            frame.broadcaster,
            frame.seq
        );

        let decision = Router::new(*self.identity).decide(&frame);
        let outcome = match decision {
            RouteDecision::Ignore => {
                trace!("Message ignored (not for me, not for forwarding)");
                Outcome::Ignored
            }
            RouteDecision::SecurityViolation => Outcome::SecurityViolation,
            RouteDecision::ForwardUpstream | RouteDecision::ForwardDownstream => {
                if self.relay(raw, &mut out) {
                    Outcome::Forwarded
                } else {
                    Outcome::Ignored
                }
            }
            RouteDecision::Process => match self.process(&frame, &mut out) {
                Handled::Done => Outcome::Processed,
                Handled::Violation => Outcome::SecurityViolation,
                Handled::Dropped => Outcome::Ignored,
            },
            RouteDecision::ProcessAndForward => match self.process(&frame, &mut out) {
                Handled::Done => {
                    if self.relay(raw, &mut out) {
                        Outcome::ProcessedAndForwarded
                    } else {
                        Outcome::Processed
                    }
                }
                Handled::Violation => Outcome::SecurityViolation,
                Handled::Dropped => Outcome::Ignored,
            },
        };
        self.count(outcome);
        out.frame = Some(frame);
        out.finish(outcome)
    }

    fn count(&self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.stats.inc_processed(),
            Outcome::Forwarded => self.stats.inc_forwarded(),
            Outcome::ProcessedAndForwarded => {
                self.stats.inc_processed();
                self.stats.inc_forwarded();
            }
            Outcome::Ignored | Outcome::Invalid => self.stats.inc_ignored(),
            Outcome::SecurityViolation => self.stats.inc_security_violations(),
        }
    }

    fn relay(&self, raw: &[u8], out: &mut Dispatched) -> bool {
        match frame::rewrite_for_forward(raw, self.identity.raw_hid()) {
            Ok(bytes) => {
                out.outbound.push(bytes);
                true
            }
            Err(e) => {
                error!("Could not rewrite frame for forwarding: {}", e);
                false
            }
        }
    }

    fn process(&mut self, frame: &Frame, out: &mut Dispatched) -> Handled {
        match frame.msg_type {
            MessageType::DataReport => self.on_data_report(frame, out),
            MessageType::DistributedIoUpdate => self.on_shared_update(frame),
            MessageType::SetOutputs => self.on_set_outputs(frame),
            MessageType::Ack => {
                match frame.payload.first() {
                    Some(seq) => info!("ACK from {} for seq {}", frame.src, seq),
                    None => info!("ACK from {}", frame.src),
                }
                Handled::Done
            }
            MessageType::Nack => {
                match frame.payload.as_slice() {
                    [seq, reason, ..] => {
                        warn!("NACK from {} for seq {} (reason {})", frame.src, seq, reason)
                    }
                    [seq] => warn!("NACK from {} for seq {}", frame.src, seq),
                    [] => warn!("NACK from {}", frame.src),
                }
                Handled::Done
            }
            MessageType::RequestBitIndex
            | MessageType::AssignBitIndex
            | MessageType::ConfirmBitIndex => {
                debug!(
                    "Bit index protocol message {:?} from {} ignored; bit indices are assigned locally",
                    frame.msg_type, frame.src
                );
                Handled::Done
            }
            MessageType::Unknown(t) => {
                warn!("Unknown tree message type 0x{:02X} from {}", t, frame.src);
                Handled::Done
            }
        }
    }

    fn on_data_report(&mut self, frame: &Frame, out: &mut Dispatched) -> Handled {
        let Some(data) = DeviceSpecificData::decode(&frame.payload) else {
            warn!(
                "Invalid data report size {} from {}",
                frame.payload.len(),
                frame.src
            );
            return Handled::Dropped;
        };
        if !self.identity.is_root() {
            debug!("Data report from {} addressed to non-root node; contents ignored", frame.src);
            return Handled::Done;
        }
        if !is_parent_child(self.identity.raw_hid(), frame.broadcaster) {
            warn!(
                target: "security",
                "Root ignoring data report from non-child broadcaster {} (orig src {})",
                frame.broadcaster, frame.src
            );
            return Handled::Violation;
        }
        debug!(
            "Data report from {} via {}: in={:08b} out={:08b} bit={}",
            frame.src, frame.broadcaster, data.input_states, data.output_states, data.bit_index
        );
        if self.table.upsert(frame.src, data) == Upsert::Rejected {
            return Handled::Done;
        }
        if let Some(state) =
            self.engine
                .maybe_recompute_and_broadcast(self.identity, self.table, self.local, self.pins)
        {
            if let Some(bytes) = encode_shared_update(self.identity, self.seq, &state) {
                out.outbound.push(bytes);
            }
        }
        Handled::Done
    }

    fn on_shared_update(&mut self, frame: &Frame) -> Handled {
        match SharedIoState::from_payload(&frame.payload) {
            Ok(state) => {
                let changes =
                    self.engine
                        .apply_received_shared_state(state, self.local, self.pins);
                debug!(
                    "Shared state from {} via {} applied ({} bits changed)",
                    frame.src,
                    frame.broadcaster,
                    changes.len()
                );
                Handled::Done
            }
            Err(e) => {
                error!("{} from {}", e, frame.src);
                Handled::Dropped
            }
        }
    }

    fn on_set_outputs(&mut self, frame: &Frame) -> Handled {
        if self.identity.is_root() {
            debug!("Set-outputs command ignored on root");
            return Handled::Done;
        }
        match frame.payload.as_slice() {
            [states] => {
                info!("CMD: set outputs to {:08b} (from {})", states, frame.src);
                self.local.write_outputs(*states, self.pins);
                Handled::Done
            }
            other => {
                warn!("Set-outputs payload of {} bytes ignored", other.len());
                Handled::Dropped
            }
        }
    }
}

/// Flood frame carrying `state`, originated by this node.
pub fn encode_shared_update(
    identity: &Identity,
    seq: &SequenceCounter,
    state: &SharedIoState,
) -> Option<Vec<u8>> {
    let src = identity.hid()?.get();
    match frame::encode(
        BROADCAST_HID,
        src,
        MessageType::DistributedIoUpdate,
        seq.next(),
        &state.to_payload(),
    ) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Failed to encode distributed I/O update: {}", e);
            None
        }
    }
}
