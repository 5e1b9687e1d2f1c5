//! Per-context DMA endpoint.
//!
//! [`Endpoint`] layers the protocol over a [`TransferChannel`]: descriptor
//! construction for each shape and direction, the fence discipline around
//! issue and completion, and the hybrid spin-then-block waits.
//!
//! Buffer arguments follow destination-first order throughout, so for a PUT
//! `dst` is an address in the remote context and `src` a local one, and for a
//! GET the other way round.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::channel::TransferChannel;
use crate::completion::{Tracking, spin_then_block};
use crate::config::EndpointConfig;
use crate::descriptor::TransferDescriptor;
use crate::error::Result;
use crate::types::{Direction, EndpointAddress, RecvStatus, SendStatus};

/// A context's view of the transport.
pub struct Endpoint<C: TransferChannel> {
    channel: Arc<C>,
    config: EndpointConfig,
}

impl<C: TransferChannel> Endpoint<C> {
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, EndpointConfig::default())
    }

    pub fn with_config(channel: C, config: EndpointConfig) -> Self {
        Self {
            channel: Arc::new(channel),
            config,
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    // =========================================================================
    // Address registry
    // =========================================================================

    /// Bind `addr` as this endpoint's receive identity.
    ///
    /// # Errors
    /// [`Error::AlreadyBound`](crate::Error::AlreadyBound) without an
    /// intervening unbind, [`Error::AddressInUse`](crate::Error::AddressInUse)
    /// if another context holds `addr`.
    pub fn bind(&self, addr: EndpointAddress) -> Result<()> {
        self.channel.bind(addr)
    }

    /// Release the bound address. An armed receive resolves with `NoRoute`.
    ///
    /// Takes the registry locks; from a signal handler use
    /// [`UnbindHandle::unbind`] instead.
    pub fn unbind(&self) -> Result<()> {
        self.channel.unbind().map(|_| ())
    }

    /// A handle that can unbind this endpoint from a signal handler or
    /// another thread.
    pub fn unbind_handle(&self) -> UnbindHandle<C> {
        UnbindHandle {
            channel: Arc::clone(&self.channel),
        }
    }

    /// Perform an unbind requested through an [`UnbindHandle`].
    fn honour_unbind_request(&self) {
        if !self.channel.take_unbind_request() {
            return;
        }
        match self.channel.unbind() {
            Ok(addr) => debug!(%addr, "unbound on request"),
            Err(e) => debug!(error = %e, "unbind request found nothing bound"),
        }
    }

    pub fn local_address(&self) -> Option<EndpointAddress> {
        self.channel.local_address()
    }

    /// Sender of the last completed tracked receive.
    pub fn read_source_address(&self) -> Option<EndpointAddress> {
        self.channel.source_address()
    }

    // =========================================================================
    // Transfer engine
    // =========================================================================

    /// Issue `desc` with explicit local and remote buffer addresses.
    ///
    /// Returns once the transfer is pending; completion is observed through
    /// [`poll_send`](Self::poll_send), [`wait_send`](Self::wait_send) or
    /// [`fence`](Self::fence).
    ///
    /// # Errors
    /// [`Error::PageFault`](crate::Error::PageFault) if the local buffer does
    /// not translate. [`Error::NotBound`](crate::Error::NotBound) if the
    /// endpoint has no address to send from.
    pub fn issue(&self, desc: &TransferDescriptor, local: u64, remote: u64) -> Result<()> {
        trace!(
            remote = %desc.remote(),
            direction = ?desc.direction(),
            shape = ?desc.shape(),
            segments = desc.segment_count(),
            bytes = desc.total_bytes(),
            "issue"
        );
        dma_fence!();
        self.channel.issue(desc, local, remote)
    }

    /// Issue `desc` with destination-first buffer addresses.
    pub fn transfer(&self, desc: &TransferDescriptor, dst: u64, src: u64) -> Result<()> {
        match desc.direction() {
            Direction::Put => self.issue(desc, src, dst),
            Direction::Get => self.issue(desc, dst, src),
        }
    }

    /// Copy `len` bytes from local `src` to `dst` in `remote`.
    pub fn put(&self, remote: EndpointAddress, dst: u64, src: u64, len: usize) -> Result<()> {
        self.transfer(&TransferDescriptor::contiguous_put(remote, len)?, dst, src)
    }

    /// Copy `len` bytes from `src` in `remote` to local `dst`.
    pub fn get(&self, remote: EndpointAddress, dst: u64, src: u64, len: usize) -> Result<()> {
        self.transfer(&TransferDescriptor::contiguous_get(remote, len)?, dst, src)
    }

    /// Fan a contiguous local buffer out to strided segments in `remote`.
    pub fn scatter_put(
        &self,
        remote: EndpointAddress,
        dst: u64,
        src: u64,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<()> {
        let desc = TransferDescriptor::scatter_put(remote, segment_size, stride, segment_count)?;
        self.transfer(&desc, dst, src)
    }

    /// Collect strided local segments into a contiguous buffer in `remote`.
    pub fn gather_put(
        &self,
        remote: EndpointAddress,
        dst: u64,
        src: u64,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<()> {
        let desc = TransferDescriptor::gather_put(remote, segment_size, stride, segment_count)?;
        self.transfer(&desc, dst, src)
    }

    /// Fan a contiguous buffer in `remote` out to strided local segments.
    pub fn scatter_get(
        &self,
        remote: EndpointAddress,
        dst: u64,
        src: u64,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<()> {
        let desc = TransferDescriptor::scatter_get(remote, segment_size, stride, segment_count)?;
        self.transfer(&desc, dst, src)
    }

    /// Collect strided segments in `remote` into a contiguous local buffer.
    pub fn gather_get(
        &self,
        remote: EndpointAddress,
        dst: u64,
        src: u64,
        segment_size: usize,
        stride: usize,
        segment_count: usize,
    ) -> Result<()> {
        let desc = TransferDescriptor::gather_get(remote, segment_size, stride, segment_count)?;
        self.transfer(&desc, dst, src)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Arm receive tracking for the next PUT landing in `[buf, buf + capacity)`.
    ///
    /// # Errors
    /// [`Error::AlreadyArmed`](crate::Error::AlreadyArmed) while a previous
    /// registration is unresolved.
    pub fn track_put(&self, buf: u64, capacity: usize) -> Result<()> {
        self.honour_unbind_request();
        self.channel.arm(Tracking::Buffer {
            addr: buf,
            capacity,
        })
    }

    /// Arm receive tracking for the next immediate.
    pub fn track_immediate(&self) -> Result<()> {
        self.honour_unbind_request();
        self.channel.arm(Tracking::Immediate)
    }

    #[inline]
    pub fn poll_recv(&self) -> RecvStatus {
        self.channel.recv_state().recv_status()
    }

    #[inline]
    pub fn poll_send(&self) -> SendStatus {
        self.channel.send_status()
    }

    /// Wait for the armed receive to resolve, using the configured spin bound.
    ///
    /// Returns `NotStarted` at once if nothing is armed. A pending unbind
    /// request is carried out here and resolves the slot with `NoRoute`.
    pub fn wait_recv(&self) -> RecvStatus {
        self.wait_recv_with(self.config.spin_bound)
    }

    pub fn wait_recv_with(&self, spin_bound: u32) -> RecvStatus {
        let timeout = self.config.block_timeout;
        let state = spin_then_block(
            spin_bound,
            || {
                self.honour_unbind_request();
                let state = self.channel.recv_state();
                (state, state.is_settled())
            },
            |observed| self.channel.block_recv(observed, timeout),
        );
        dma_fence!();
        state.recv_status()
    }

    /// Wait until every issued operation has resolved, using the configured
    /// spin bound.
    pub fn wait_send(&self) -> SendStatus {
        self.wait_send_with(self.config.spin_bound)
    }

    pub fn wait_send_with(&self, spin_bound: u32) -> SendStatus {
        let timeout = self.config.block_timeout;
        let status = spin_then_block(
            spin_bound,
            || {
                let status = self.channel.send_status();
                (status, status.is_terminal())
            },
            |_| self.channel.block_send(timeout),
        );
        dma_fence!();
        status
    }

    /// Wait for all issued operations and report the first error among them.
    pub fn fence(&self) -> Result<()> {
        self.wait_send().into_result().map(|_| ())
    }

    // =========================================================================
    // Immediate channel
    // =========================================================================

    /// Send one word to `remote`. Completes like a zero-length transfer.
    pub fn send_immediate(&self, remote: EndpointAddress, value: u64) -> Result<()> {
        trace!(%remote, value, "send immediate");
        dma_fence!();
        self.channel.send_immediate(remote, value)
    }

    /// The immediate delivered in the current arm cycle. Returns it once.
    pub fn read_immediate(&self) -> Option<u64> {
        self.channel.take_immediate()
    }
}

/// Cloneable handle that unbinds an [`Endpoint`] from a signal handler or
/// any other thread.
pub struct UnbindHandle<C: TransferChannel> {
    channel: Arc<C>,
}

impl<C: TransferChannel> UnbindHandle<C> {
    /// Request that the endpoint release its address.
    ///
    /// Async-signal-safe: takes no locks and does not allocate. The endpoint
    /// unbinds on its next `wait_recv` or `track_*`; a waiter blocked in
    /// `wait_recv` notices within one `block_timeout` and returns `NoRoute`.
    pub fn unbind(&self) {
        self.channel.request_unbind();
    }
}

impl<C: TransferChannel> Clone for UnbindHandle<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}
