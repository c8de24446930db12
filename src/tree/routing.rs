//! Routing decisions from the frame header alone.
//!
//! Every frame is physically heard by every node in range, so each node
//! decides locally whether a frame is for it, whether it must relay it one hop
//! further up or down the tree, or whether to drop it. The `broadcaster`
//! field (the most recent transmitter) stands in for a link layer: upward
//! relays must come from a direct child, downward relays from the direct
//! parent.
use log::{trace, warn};
use serde::Serialize;

use super::frame::Frame;
use super::hid::{is_parent_child, ROOT_HID};
use super::identity::Identity;

/// Outcome of the upstream check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// Destination is not above this node.
    NotApplicable,
    Forward,
    /// Destination is above this node but the hop did not come from a child.
    Violation,
}

/// Final classification of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteDecision {
    Process,
    ForwardUpstream,
    ForwardDownstream,
    /// Flood frames: apply locally and relay to children.
    ProcessAndForward,
    SecurityViolation,
    Ignore,
}

impl RouteDecision {
    pub fn processes(self) -> bool {
        matches!(self, RouteDecision::Process | RouteDecision::ProcessAndForward)
    }

    pub fn forwards(self) -> bool {
        matches!(
            self,
            RouteDecision::ForwardUpstream
                | RouteDecision::ForwardDownstream
                | RouteDecision::ProcessAndForward
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Router {
    identity: Identity,
}

impl Router {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn my_hid(&self) -> Option<u16> {
        self.identity.hid().map(|h| h.get())
    }

    pub fn should_process(&self, dest: u16) -> bool {
        self.my_hid() == Some(dest)
    }

    pub fn upstream(&self, dest: u16, broadcaster: u16) -> Upstream {
        let Some(hid) = self.identity.hid() else {
            return Upstream::NotApplicable;
        };
        if hid.is_root() {
            return Upstream::NotApplicable;
        }
        let above = dest == ROOT_HID || hid.ancestors().any(|a| a.get() == dest);
        if !above {
            return Upstream::NotApplicable;
        }
        if is_parent_child(hid.get(), broadcaster) {
            Upstream::Forward
        } else {
            warn!(
                target: "security",
                "Security violation: {} claims to be child of {} (dest {})",
                broadcaster, hid, dest
            );
            Upstream::Violation
        }
    }

    pub fn should_forward_upstream(&self, dest: u16, broadcaster: u16) -> bool {
        self.upstream(dest, broadcaster) == Upstream::Forward
    }

    pub fn should_forward_downstream(&self, dest: u16, broadcaster: u16) -> bool {
        let Some(hid) = self.identity.hid() else {
            return false;
        };
        // hop-by-hop from the direct parent only; the root has no parent
        if broadcaster != self.identity.parent_hid() || broadcaster == 0 {
            return false;
        }
        if dest == hid.get() {
            return false;
        }
        hid.is_descendant(dest)
    }

    /// Flood frames ignore the destination: accepted from the direct parent only.
    fn decide_flood(&self, frame: &Frame) -> RouteDecision {
        let Some(hid) = self.identity.hid() else {
            return RouteDecision::Ignore;
        };
        if hid.is_root() {
            return RouteDecision::Ignore;
        }
        if frame.broadcaster == self.identity.parent_hid() {
            RouteDecision::ProcessAndForward
        } else {
            warn!(
                target: "security",
                "Ignoring flood from non-parent broadcaster {} (expected parent {})",
                frame.broadcaster,
                self.identity.parent_hid()
            );
            RouteDecision::SecurityViolation
        }
    }

    pub fn decide(&self, frame: &Frame) -> RouteDecision {
        if !self.identity.is_configured() {
            return RouteDecision::Ignore;
        }
        if frame.msg_type.is_flood() {
            return self.decide_flood(frame);
        }
        let decision = match self.upstream(frame.dest, frame.broadcaster) {
            Upstream::Violation => RouteDecision::SecurityViolation,
            Upstream::Forward => RouteDecision::ForwardUpstream,
            Upstream::NotApplicable => {
                if self.should_process(frame.dest) {
                    RouteDecision::Process
                } else if self.should_forward_downstream(frame.dest, frame.broadcaster) {
                    RouteDecision::ForwardDownstream
                } else {
                    RouteDecision::Ignore
                }
            }
        };
        trace!(
            "route {:?}: dest={} src={} via={} -> {:?}",
            frame.msg_type,
            frame.dest,
            frame.src,
            frame.broadcaster,
            decision
        );
        decision
    }
}
