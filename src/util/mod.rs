//! Internal utilities.

pub mod arena;

pub use arena::{SlotIndex, SlotTable};
