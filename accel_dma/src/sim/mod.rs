//! Software backend for [`TransferChannel`](crate::TransferChannel).
//!
//! A [`Fabric`] plays the role of the accelerator and its network: it routes
//! by endpoint address, translates buffers through registered
//! [`MemoryRegion`]s, and drives the same completion trackers a hardware
//! backend would expose through its status registers.

mod channel;
mod fabric;
mod memory;

pub use channel::SimChannel;
pub use fabric::Fabric;
pub use memory::{Access, MemoryRegion, PAGE_SIZE, Plain};
