//! Per-context handle onto the simulated fabric.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use tracing::debug;

use crate::channel::TransferChannel;
use crate::completion::{CompletionState, Tracking};
use crate::descriptor::TransferDescriptor;
use crate::error::{Error, Result};
use crate::types::{Direction, EndpointAddress, Outcome, SendStatus};

use super::fabric::{Command, ContextState, FabricShared, SendCompletion};
use super::memory::{Access, MemoryRegion};

/// One context on a [`Fabric`](super::Fabric).
///
/// Unbinds on drop.
pub struct SimChannel {
    ctx: Arc<ContextState>,
    shared: Arc<FabricShared>,
    tx: SyncSender<Command>,
}

impl SimChannel {
    pub(crate) fn new(
        ctx: Arc<ContextState>,
        shared: Arc<FabricShared>,
        tx: SyncSender<Command>,
    ) -> Self {
        Self { ctx, shared, tx }
    }

    /// Allocate and register a zeroed region of `len` bytes.
    ///
    /// # Errors
    /// Fails with [`Error::Io`] if `len` is zero or the allocation fails.
    pub fn alloc_region(&self, len: usize, access: Access) -> Result<MemoryRegion> {
        let region = MemoryRegion::register(&self.ctx.space, len, access)?;
        debug!(addr = region.addr(), len, ?access, "registered memory region");
        Ok(region)
    }

    /// Enable or disable local address translation.
    ///
    /// While disabled, every outbound operation faults with `PageFault`.
    pub fn set_translation(&self, enabled: bool) {
        debug!(enabled, "local translation switched");
        self.ctx.space.set_translation(enabled);
    }

    pub fn translation_enabled(&self) -> bool {
        self.ctx.space.translation_enabled()
    }

    fn submit(&self, command: Command) -> Result<()> {
        // A rejected command is dropped here, which resolves it as NoRoute.
        self.tx.send(command).map_err(|_| Error::Disconnected)
    }

    /// Record a synchronous local fault on the send side.
    fn fault(&self) -> Error {
        SendCompletion::begin(&self.ctx).complete(Outcome::PageFault);
        Error::PageFault
    }
}

impl TransferChannel for SimChannel {
    fn bind(&self, addr: EndpointAddress) -> Result<()> {
        self.shared
            .ports
            .bind(&self.ctx.binding, addr, Arc::clone(&self.ctx))
    }

    fn unbind(&self) -> Result<EndpointAddress> {
        // A direct unbind supersedes any pending request.
        self.ctx.unbind_requested.store(false, Ordering::Release);
        let addr = self.shared.ports.unbind(&self.ctx.binding)?;
        if self.ctx.recv.abandon() {
            debug!(%addr, "armed registration resolved by unbind");
        }
        Ok(addr)
    }

    fn request_unbind(&self) {
        self.ctx.unbind_requested.store(true, Ordering::Release);
    }

    fn take_unbind_request(&self) -> bool {
        self.ctx.unbind_requested.load(Ordering::Acquire)
            && self.ctx.unbind_requested.swap(false, Ordering::AcqRel)
    }

    fn local_address(&self) -> Option<EndpointAddress> {
        self.ctx.binding.get()
    }

    fn issue(&self, desc: &TransferDescriptor, local: u64, remote: u64) -> Result<()> {
        let source = self.ctx.binding.require()?;

        let span = desc.local_span();
        let needed = match desc.direction() {
            Direction::Put => Access::empty(),
            Direction::Get => Access::LOCAL_WRITE,
        };
        let local = if span == 0 {
            if !self.ctx.space.translation_enabled() {
                return Err(self.fault());
            }
            None
        } else {
            match self.ctx.space.translate(local, span, needed) {
                Some(translation) => Some(translation),
                None => return Err(self.fault()),
            }
        };

        self.submit(Command::Transfer {
            completion: SendCompletion::begin(&self.ctx),
            source,
            desc: *desc,
            local,
            remote_addr: remote,
        })
    }

    fn send_immediate(&self, remote: EndpointAddress, value: u64) -> Result<()> {
        let source = self.ctx.binding.require()?;
        if !self.ctx.space.translation_enabled() {
            return Err(self.fault());
        }
        self.submit(Command::Immediate {
            completion: SendCompletion::begin(&self.ctx),
            source,
            remote,
            value,
        })
    }

    fn arm(&self, tracking: Tracking) -> Result<()> {
        self.ctx.binding.with_bound(|addr| {
            self.ctx.recv.arm(tracking)?;
            debug!(%addr, ?tracking, "armed receive tracking");
            Ok(())
        })
    }

    fn recv_state(&self) -> CompletionState {
        self.ctx.recv.state()
    }

    fn send_status(&self) -> SendStatus {
        self.ctx.send.poll()
    }

    fn block_recv(&self, observed: CompletionState, timeout: Duration) {
        self.ctx.recv.block(observed, timeout);
    }

    fn block_send(&self, timeout: Duration) {
        self.ctx.send.block(timeout);
    }

    fn take_immediate(&self) -> Option<u64> {
        self.ctx.recv.take_immediate()
    }

    fn source_address(&self) -> Option<EndpointAddress> {
        self.ctx.recv.source()
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        // NotBound is the only failure and needs no handling.
        let _ = self.unbind();
    }
}
