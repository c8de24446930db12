//! Whole-tree simulation over [`SimulatedAir`].
//!
//! Every configured node runs as its own tokio task with a volatile identity
//! store. Scripted input events are delivered as [`NodeCommand::SetInputs`]
//! at their offsets; after the configured duration all nodes are stopped and
//! their final status collected.
use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::SimulationConfig;
use crate::io::device::MemoryPins;
use crate::io::shared::SharedIoState;
use crate::node::{NodeCommand, NodeSettings, NodeStatus, TreeNode};
use crate::radio::{station_address, AirSettings, SimulatedAir};
use crate::tree::identity::{IdentityStore, MemoryIdentityStore};

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub duration_ms: u64,
    pub root_shared: Option<SharedIoState>,
    /// Every node mirrors the root's shared state.
    pub converged: bool,
    pub nodes: Vec<NodeStatus>,
}

pub async fn run(sim: &SimulationConfig, settings: &NodeSettings) -> Result<SimReport> {
    if sim.nodes.is_empty() {
        return Err(anyhow!("simulation has no nodes"));
    }
    let air = SimulatedAir::spawn(AirSettings {
        loss: sim.loss,
        seed: sim.seed,
        ..AirSettings::default()
    });

    // scripted inputs replace pin reads
    let mut node_settings = settings.clone();
    node_settings.layout.input_pins.clear();

    let mut controls = Vec::with_capacity(sim.nodes.len());
    let mut handles = Vec::with_capacity(sim.nodes.len());
    for spec in &sim.nodes {
        let store = Arc::new(MemoryIdentityStore::new());
        store.save_hid(spec.hid)?;
        if let Some(bit) = spec.bit_index {
            store.save_bit_index(bit)?;
        }
        let (radio, frames) = air.attach(station_address(spec.hid));
        let node = TreeNode::new(store, radio, MemoryPins::new(), node_settings.clone())?;
        let (tx, rx) = mpsc::unbounded_channel();
        controls.push(tx);
        handles.push(tokio::spawn(node.run(frames, rx, POLL)));
    }
    info!("Simulation started with {} nodes", sim.nodes.len());

    let mut events: Vec<(u64, usize, u8)> = sim
        .nodes
        .iter()
        .enumerate()
        .flat_map(|(i, n)| n.events.iter().map(move |e| (e.at_ms, i, e.inputs)))
        .collect();
    events.sort_by_key(|(at, i, _)| (*at, *i));

    let start = Instant::now();
    for (at_ms, index, inputs) in events {
        if at_ms >= sim.duration_ms {
            warn!("Input event at {} ms is past the end of the run; skipped", at_ms);
            continue;
        }
        sleep_until(start + Duration::from_millis(at_ms)).await;
        info!("t={}ms node {} inputs -> {:03b}", at_ms, sim.nodes[index].hid, inputs);
        let _ = controls[index].send(NodeCommand::SetInputs(inputs));
    }
    sleep_until(start + Duration::from_millis(sim.duration_ms)).await;

    for control in &controls {
        let _ = control.send(NodeCommand::Shutdown);
    }
    let mut nodes = Vec::with_capacity(handles.len());
    for handle in handles {
        let node = handle.await?;
        nodes.push(node.status());
    }

    let root_shared = nodes.iter().find(|n| n.is_root).map(|n| n.shared);
    let converged = match root_shared {
        Some(shared) => nodes.iter().all(|n| n.shared == shared),
        None => false,
    };
    Ok(SimReport {
        duration_ms: sim.duration_ms,
        root_shared,
        converged,
        nodes,
    })
}
