//! Test utilities & fixtures.
//! A deterministic bench of tree nodes wired through recording radios. Frames
//! are pumped by hand so every test sees the same delivery order.

use std::sync::Arc;
use std::time::Duration;

use treemesh::io::device::MemoryPins;
use treemesh::node::{NodeSettings, TreeNode};
use treemesh::radio::{station_address, RecordingRadio, RxEvent};
use treemesh::tree::hid::is_parent_child;
use treemesh::tree::identity::{IdentityStore, MemoryIdentityStore};

pub type BenchNode = TreeNode<RecordingRadio, MemoryPins>;

pub struct Bench {
    pub nodes: Vec<(u16, BenchNode)>,
}

/// Settings without report pacing so consecutive input changes all report.
#[allow(dead_code)]
pub fn unpaced() -> NodeSettings {
    NodeSettings {
        report_rate_limit: Duration::ZERO,
        ..NodeSettings::default()
    }
}

pub fn node(hid: u16, bit: Option<u8>, settings: NodeSettings) -> BenchNode {
    let store = Arc::new(MemoryIdentityStore::new());
    store.save_hid(hid).expect("save hid");
    if let Some(b) = bit {
        store.save_bit_index(b).expect("save bit");
    }
    let radio = RecordingRadio::new(station_address(hid));
    TreeNode::new(store, radio, MemoryPins::new(), settings).expect("node")
}

impl Bench {
    pub fn new(members: &[(u16, Option<u8>)], settings: NodeSettings) -> Self {
        let nodes = members
            .iter()
            .map(|(hid, bit)| (*hid, node(*hid, *bit, settings.clone())))
            .collect();
        Self { nodes }
    }

    pub fn get(&self, hid: u16) -> &BenchNode {
        &self.nodes.iter().find(|(h, _)| *h == hid).expect("no such node").1
    }

    pub fn get_mut(&mut self, hid: u16) -> &mut BenchNode {
        &mut self
            .nodes
            .iter_mut()
            .find(|(h, _)| *h == hid)
            .expect("no such node")
            .1
    }

    /// Deliver queued frames to the sender's radio neighbours (its parent and
    /// children) until the air is quiet. Returns the number of transmissions.
    pub fn pump(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..64 {
            let mut airborne = Vec::new();
            for (hid, node) in &self.nodes {
                for bytes in node.radio().take_sent() {
                    airborne.push((*hid, bytes));
                }
            }
            if airborne.is_empty() {
                return total;
            }
            total += airborne.len();
            for (from, bytes) in airborne {
                for (hid, node) in self.nodes.iter_mut() {
                    if is_parent_child(from, *hid) || is_parent_child(*hid, from) {
                        node.handle_received(RxEvent {
                            bytes: bytes.clone(),
                            sender: station_address(from),
                            rssi: -55,
                        });
                    }
                }
            }
        }
        panic!("air never went quiet");
    }
}
