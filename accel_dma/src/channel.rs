//! The transport capability.
//!
//! [`TransferChannel`] is the seam between the protocol logic in
//! [`Endpoint`](crate::Endpoint) and whatever moves the bytes: the software
//! fabric in [`sim`](crate::sim), or a hardware backend driving the
//! accelerator's issue path and status registers.

use std::time::Duration;

use crate::completion::{CompletionState, Tracking};
use crate::descriptor::TransferDescriptor;
use crate::error::Result;
use crate::types::{EndpointAddress, SendStatus};

/// A per-context handle onto the DMA transport.
///
/// Each channel owns at most one bound address and one receive tracking slot.
pub trait TransferChannel: Send + Sync {
    /// Bind `addr` as this context's receive identity.
    fn bind(&self, addr: EndpointAddress) -> Result<()>;

    /// Release the bound address, resolving any armed registration with
    /// `NoRoute`.
    fn unbind(&self) -> Result<EndpointAddress>;

    /// Ask for the bound address to be released by the owning context.
    ///
    /// Async-signal-safe: implementations must only touch atomics here. The
    /// owner performs the unbind on its next receive wait or arm.
    fn request_unbind(&self);

    /// Consume a pending [`request_unbind`](Self::request_unbind).
    fn take_unbind_request(&self) -> bool;

    /// The currently bound address.
    fn local_address(&self) -> Option<EndpointAddress>;

    /// Hand a transfer to the engine.
    ///
    /// `local` and `remote` are the base addresses of the local and remote
    /// buffers; which one is the source depends on the descriptor's direction.
    /// `Ok(())` means the transfer is pending and its outcome is reported
    /// through [`send_status`](Self::send_status). Faults detected before the
    /// transfer leaves the node are returned directly.
    fn issue(&self, desc: &TransferDescriptor, local: u64, remote: u64) -> Result<()>;

    /// Send one word to `remote`. Completes like a zero-length transfer.
    fn send_immediate(&self, remote: EndpointAddress, value: u64) -> Result<()>;

    /// Arm the receive tracking slot. Requires a bound address.
    fn arm(&self, tracking: Tracking) -> Result<()>;

    /// Current state of the receive tracking slot.
    fn recv_state(&self) -> CompletionState;

    /// Aggregate status of the operations issued from this channel.
    fn send_status(&self) -> SendStatus;

    /// Suspend until the receive state moves away from `observed`, at most
    /// `timeout`. Spurious returns are allowed.
    fn block_recv(&self, observed: CompletionState, timeout: Duration);

    /// Suspend until an outstanding send resolves, at most `timeout`.
    /// Spurious returns are allowed.
    fn block_send(&self, timeout: Duration);

    /// Take the immediate delivered in the current arm cycle.
    fn take_immediate(&self) -> Option<u64>;

    /// Sender of the last completed tracked receive.
    fn source_address(&self) -> Option<EndpointAddress>;
}
