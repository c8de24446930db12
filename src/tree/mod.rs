//! Tree network protocol: addressing, framing, identity, routing, dispatch
//! and the root's device table.
pub mod aggregate;
pub mod dispatch;
pub mod frame;
pub mod hid;
pub mod identity;
pub mod routing;

pub use aggregate::{AggregatedDevice, AggregationTable, Upsert};
pub use dispatch::{Dispatched, Dispatcher, Outcome};
pub use frame::{Frame, FrameError, MessageType};
pub use hid::{Hid, BROADCAST_HID, ROOT_HID, UNCONFIGURED_HID};
pub use identity::{Identity, IdentityStore, MemoryIdentityStore, SledIdentityStore, StoreError};
pub use routing::{RouteDecision, Router};
