//! Distributed I/O: local pins, tree-wide shared bitmaps and the root's
//! aggregation engine.
pub mod device;
pub mod engine;
pub mod policy;
pub mod shared;

pub use device::{DeviceSpecificData, LocalIo, MemoryPins, OutputSource, PinIo, PinLayout};
pub use engine::IoEngine;
pub use policy::{AndPolicy, MirrorPolicy, OutputPolicy};
pub use shared::{BitChange, SharedIoState};
