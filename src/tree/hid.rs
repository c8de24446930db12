//! Hierarchical IDs.
//!
//! A HID encodes a node's position in the tree as decimal digits: `1` is the
//! root, `12` is the second child of the root, `121` the first child of `12`.
//! The parent is obtained by dropping the last digit, so every relationship
//! in the tree is plain integer arithmetic on base 10.
//!
//! Fan-out is assumed to be at most 9 children per node (digits 1-9). Digit 0
//! is accepted (e.g. `10`) but a node can never address more than ten children
//! because each level is exactly one decimal digit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for a node that has not been given a HID yet. Never valid on the wire.
pub const UNCONFIGURED_HID: u16 = 0;
/// The fixed root of every tree.
pub const ROOT_HID: u16 = 1;
/// Destination marker for generic broadcast sends.
pub const BROADCAST_HID: u16 = 0xFFFF;

/// A configured (non-zero, non-broadcast) tree position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Hid(u16);

impl Hid {
    pub const ROOT: Hid = Hid(ROOT_HID);

    /// Returns `None` for the unconfigured sentinel and the broadcast marker.
    pub fn new(raw: u16) -> Option<Self> {
        match raw {
            UNCONFIGURED_HID | BROADCAST_HID => None,
            v => Some(Hid(v)),
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self.0 == ROOT_HID
    }

    /// Parent position, `None` for the root.
    pub fn parent(self) -> Option<Hid> {
        Hid::new(parent_of(self.0))
    }

    /// Child position reached by appending `digit`. `None` on overflow.
    pub fn child(self, digit: u8) -> Option<Hid> {
        child_of(self.0, digit).and_then(Hid::new)
    }

    pub fn depth(self) -> u8 {
        depth(self.0)
    }

    /// Ancestors from the direct parent up to and including the root.
    pub fn ancestors(self) -> Ancestors {
        Ancestors { current: self.0 }
    }

    pub fn is_parent_of(self, other: u16) -> bool {
        is_parent_child(self.0, other)
    }

    pub fn is_descendant(self, target: u16) -> bool {
        is_descendant(self.0, target)
    }
}

impl TryFrom<u16> for Hid {
    type Error = String;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Hid::new(raw).ok_or_else(|| format!("{} is not a valid HID", raw))
    }
}

impl From<Hid> for u16 {
    fn from(hid: Hid) -> u16 {
        hid.0
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Iterator over ancestors, nearest first.
#[derive(Debug, Clone)]
pub struct Ancestors {
    current: u16,
}

impl Iterator for Ancestors {
    type Item = Hid;

    fn next(&mut self) -> Option<Hid> {
        if self.current <= ROOT_HID {
            return None;
        }
        self.current = parent_of(self.current);
        Hid::new(self.current)
    }
}

/// Integer truncation: `121 -> 12`, `1 -> 0`.
pub fn parent_of(hid: u16) -> u16 {
    hid / 10
}

pub fn child_of(hid: u16, digit: u8) -> Option<u16> {
    if digit > 9 {
        return None;
    }
    hid.checked_mul(10)?.checked_add(digit as u16)
}

pub fn is_parent_child(parent: u16, child: u16) -> bool {
    child / 10 == parent
}

/// Number of decimal digits. The unconfigured sentinel has depth 0.
pub fn depth(hid: u16) -> u8 {
    let mut depth = 0;
    let mut h = hid;
    while h > 0 {
        depth += 1;
        h /= 10;
    }
    depth
}

/// True iff the decimal representation of `me` is a proper prefix of
/// `target`'s. Computed by stripping trailing digits from `target`, which is
/// the same relation without string formatting. The broadcast marker is not
/// a tree position and is never a descendant.
pub fn is_descendant(me: u16, target: u16) -> bool {
    if me == UNCONFIGURED_HID || target == BROADCAST_HID || target == me {
        return false;
    }
    let mut t = target;
    while t > me {
        t /= 10;
        if t == me {
            return true;
        }
    }
    false
}
