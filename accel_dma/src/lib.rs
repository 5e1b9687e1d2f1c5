//! accel_dma - remote DMA transport for accelerator endpoints.
//!
//! Contexts bind to logical addresses, issue contiguous or strided
//! scatter/gather transfers to remote endpoints, exchange word-sized
//! immediates, and observe completion by polling or by a hybrid
//! spin-then-block wait.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────────── Endpoint<C> ─────────────────────────────┐
//!  │ bind/unbind   put/get/scatter/gather   track_*/wait_*   immediates    │
//!  │      │                 │                     │               │        │
//!  │      │          TransferDescriptor           │               │        │
//!  │      │                 │      fence          │               │        │
//!  └──────┼─────────────────┼─────────────────────┼───────────────┼────────┘
//!         ▼                 ▼                     ▼               ▼
//!  ┌───────────────────────────── TransferChannel ─────────────────────────┐
//!  │  sim::Fabric: port table, region translation, engine thread,          │
//!  │               RecvTracker / SendTracker per context                   │
//!  └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use accel_dma::sim::{Access, Fabric};
//! use accel_dma::{EndpointAddress, FabricConfig};
//!
//! let fabric = Fabric::new(FabricConfig::default())?;
//! let ep = fabric.endpoint();
//! let addr = EndpointAddress::local(16);
//! ep.bind(addr)?;
//!
//! let src = ep.channel().alloc_region(64, Access::all())?;
//! let dst = ep.channel().alloc_region(64, Access::all())?;
//! // Region accessors are unsafe while a transfer may touch the range.
//! unsafe { src.write_slice(0, &[1u32, 2, 3, 4]) };
//!
//! ep.put(addr, dst.addr(), src.addr(), 16)?;
//! ep.fence()?;
//! assert_eq!(unsafe { dst.read_slice::<u32>(0, 4) }, vec![1, 2, 3, 4]);
//! # Ok::<(), accel_dma::Error>(())
//! ```

#[macro_use]
mod barrier;

pub mod channel;
pub mod completion;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod sim;
pub mod types;

pub use channel::TransferChannel;
pub use completion::{CompletionState, Tracking};
pub use config::{EndpointConfig, FabricConfig};
pub use descriptor::{DescriptorBuilder, Segment, TransferDescriptor};
pub use endpoint::{Endpoint, UnbindHandle};
pub use error::{DescriptorError, Error, Result};
pub use types::{Direction, EndpointAddress, LOCAL_NODE, Outcome, RecvStatus, SendStatus, Shape};
