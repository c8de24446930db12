//! # Treemesh - Distributed I/O over a Broadcast Tree
//!
//! Treemesh runs a small fleet of I/O nodes over a connectionless broadcast
//! radio. Nodes are addressed by a hierarchical ID (HID) whose decimal digits
//! encode the path from the root, so every node can compute its parent and
//! depth without a routing table.
//!
//! ## Features
//!
//! - **Tree Routing**: Upstream frames climb toward the root through direct
//!   parents, downstream frames descend through the owning subtree, and flood
//!   frames spread level by level.
//! - **Integrity Checks**: Every frame carries start/end markers and a CRC-8.
//! - **Distributed I/O**: The root aggregates input bits from every device,
//!   runs an output policy, and floods the shared state back to all nodes.
//! - **Persistent Identity**: HID and bit index survive restarts in a sled tree.
//! - **Simulation**: An in-process radio medium drives whole trees under tokio.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use treemesh::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let report = treemesh::sim::run(&config.simulation, &config.node_settings()).await?;
//!     println!("converged: {}", report.converged);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`tree`] - HID arithmetic, frame codec, identity, routing, dispatch and aggregation
//! - [`io`] - Local pins, shared I/O state, output policies and the root engine
//! - [`node`] - A complete node wired to a radio, with its event loop
//! - [`radio`] - The radio seam plus recording and simulated implementations
//! - [`metrics`] - Link statistics and sequence numbers
//! - [`config`] - Configuration management and validation
//! - [`sim`] - Multi-node simulation runner
//! - [`logutil`] - Formatting helpers for log output
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Radio      │───▶│  TreeNode    │───▶│  Dispatcher  │
//! │ (broadcast)  │◀───│  (run loop)  │◀───│ (one frame)  │
//! └──────────────┘    └──────────────┘    └──────┬───────┘
//!                                                │
//!                     ┌──────────────┐    ┌──────▼───────┐
//!                     │  LocalIo     │◀───│  IoEngine    │
//!                     │  (pins)      │    │  + table     │
//!                     └──────────────┘    └──────────────┘
//! ```

pub mod config;
pub mod io;
pub mod logutil;
pub mod metrics;
pub mod node;
pub mod radio;
pub mod sim;
pub mod tree;
