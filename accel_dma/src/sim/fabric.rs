//! Software DMA fabric.
//!
//! One engine thread executes transfers and immediates in FIFO order from a
//! bounded command queue. Contexts are reached through the port table; a
//! context's registered regions are the only memory the engine will touch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

use crate::completion::{PutAdmission, RecvTracker, SendTracker};
use crate::config::{EndpointConfig, FabricConfig};
use crate::descriptor::TransferDescriptor;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::registry::{Binding, PortTable};
use crate::types::{Direction, EndpointAddress, Outcome};

use super::channel::SimChannel;
use super::memory::{Access, AddressSpace, Translation, copy_segment};

/// Per-context state shared between a channel and the engine.
pub(crate) struct ContextState {
    pub(crate) space: Arc<AddressSpace>,
    pub(crate) recv: RecvTracker,
    pub(crate) send: SendTracker,
    pub(crate) binding: Binding,
    /// Set from signal context; honoured by the owner's next wait or arm.
    pub(crate) unbind_requested: AtomicBool,
}

impl ContextState {
    fn new() -> Self {
        Self {
            space: Arc::new(AddressSpace::new()),
            recv: RecvTracker::new(),
            send: SendTracker::new(),
            binding: Binding::new(),
            unbind_requested: AtomicBool::new(false),
        }
    }
}

pub(crate) struct FabricShared {
    pub(crate) ports: PortTable<ContextState>,
    pub(crate) config: FabricConfig,
    /// Set when the fabric is dropped; the engine stops executing commands.
    stopping: AtomicBool,
}

/// Resolves one send-side operation exactly once.
///
/// A command dropped without being executed (engine shut down) resolves its
/// operation with `NoRoute`, so no sender waits forever.
pub(crate) struct SendCompletion {
    origin: Arc<ContextState>,
    resolved: bool,
}

impl SendCompletion {
    /// Record a new outstanding operation on `origin`.
    pub(crate) fn begin(origin: &Arc<ContextState>) -> Self {
        origin.send.begin();
        Self {
            origin: Arc::clone(origin),
            resolved: false,
        }
    }

    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.resolved = true;
        self.origin.send.complete(outcome);
    }
}

impl Drop for SendCompletion {
    fn drop(&mut self) {
        if !self.resolved {
            self.origin.send.complete(Outcome::NoRoute);
        }
    }
}

pub(crate) enum Command {
    Transfer {
        completion: SendCompletion,
        source: EndpointAddress,
        desc: TransferDescriptor,
        /// `None` for zero-length transfers.
        local: Option<Translation>,
        remote_addr: u64,
    },
    Immediate {
        completion: SendCompletion,
        source: EndpointAddress,
        remote: EndpointAddress,
        value: u64,
    },
    Shutdown,
}

// =============================================================================
// Fabric
// =============================================================================

/// A simulated DMA fabric connecting any number of contexts.
///
/// Dropping the fabric stops the engine. The operation being executed runs to
/// completion, queued operations resolve with `NoRoute`, and later issues fail
/// with [`Error::Disconnected`](crate::Error::Disconnected).
pub struct Fabric {
    shared: Arc<FabricShared>,
    tx: SyncSender<Command>,
    engine: Option<JoinHandle<()>>,
}

impl Fabric {
    /// Start a fabric and its engine thread.
    pub fn new(config: FabricConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(config.queue_depth);
        let shared = Arc::new(FabricShared {
            ports: PortTable::new(),
            config,
            stopping: AtomicBool::new(false),
        });

        let engine = Engine {
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name("dma-engine".to_string())
            .spawn(move || engine.run(rx))?;

        debug!(
            queue_depth = shared.config.queue_depth,
            segment_latency = ?shared.config.segment_latency,
            "fabric started"
        );
        Ok(Self {
            shared,
            tx,
            engine: Some(handle),
        })
    }

    /// Create a new unbound context on this fabric.
    pub fn channel(&self) -> SimChannel {
        SimChannel::new(
            Arc::new(ContextState::new()),
            Arc::clone(&self.shared),
            self.tx.clone(),
        )
    }

    /// Create an endpoint over a new context with the default configuration.
    pub fn endpoint(&self) -> Endpoint<SimChannel> {
        Endpoint::new(self.channel())
    }

    /// Create an endpoint over a new context.
    pub fn endpoint_with_config(&self, config: EndpointConfig) -> Endpoint<SimChannel> {
        Endpoint::with_config(self.channel(), config)
    }

    pub fn config(&self) -> &FabricConfig {
        &self.shared.config
    }

    /// Number of bound addresses.
    pub fn bound_count(&self) -> usize {
        self.shared.ports.len()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        // Commands queued ahead of Shutdown are skipped, not executed.
        self.shared.stopping.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Shutdown);
        if let Some(engine) = self.engine.take() {
            if engine.join().is_err() {
                warn!("DMA engine thread panicked");
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

struct Engine {
    shared: Arc<FabricShared>,
}

impl Engine {
    fn run(self, rx: Receiver<Command>) {
        let mut dropped = 0usize;
        while let Ok(command) = rx.recv() {
            if matches!(command, Command::Shutdown) {
                break;
            }
            if self.shared.stopping.load(Ordering::Acquire) {
                // Dropping the command resolves it with NoRoute.
                dropped += 1;
                continue;
            }
            self.execute(command);
        }

        dropped += rx.try_iter().count();
        debug!(dropped, "fabric stopped");
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Transfer {
                completion,
                source,
                desc,
                local,
                remote_addr,
            } => {
                let outcome = self.transfer(source, &desc, local, remote_addr);
                if outcome != Outcome::Success {
                    warn!(%source, remote = %desc.remote(), ?outcome, "transfer failed");
                }
                completion.complete(outcome);
            }
            Command::Immediate {
                completion,
                source,
                remote,
                value,
            } => {
                let outcome = self.immediate(source, remote, value);
                if outcome != Outcome::Success {
                    warn!(%source, %remote, ?outcome, "immediate failed");
                }
                completion.complete(outcome);
            }
            Command::Shutdown => {}
        }
    }

    fn transfer(
        &self,
        source: EndpointAddress,
        desc: &TransferDescriptor,
        local: Option<Translation>,
        remote_addr: u64,
    ) -> Outcome {
        let Some(target) = self.shared.ports.resolve(desc.remote()) else {
            return Outcome::NoRoute;
        };
        trace!(
            %source,
            remote = %desc.remote(),
            direction = ?desc.direction(),
            shape = ?desc.shape(),
            bytes = desc.total_bytes(),
            "executing transfer"
        );

        let span = desc.remote_span();
        let needed = match desc.direction() {
            Direction::Put => Access::REMOTE_WRITE,
            Direction::Get => Access::REMOTE_READ,
        };
        let remote = if span == 0 {
            None
        } else {
            match target.space.lookup(remote_addr, span, needed) {
                Some(translation) => Some(translation),
                None => return Outcome::Nack,
            }
        };

        match desc.direction() {
            Direction::Put => {
                let footprint = remote_addr..remote_addr.saturating_add(span as u64);
                let admission = target.recv.admit_put(footprint);
                if admission == PutAdmission::Rejected {
                    return Outcome::Nack;
                }
                if let (Some(src), Some(dst)) = (&local, &remote) {
                    self.copy(desc, src, dst);
                }
                if let PutAdmission::Tracked(generation) = admission {
                    target.recv.finish_put(generation, Outcome::Success, source);
                }
            }
            Direction::Get => {
                if let (Some(src), Some(dst)) = (&remote, &local) {
                    self.copy(desc, src, dst);
                }
            }
        }
        Outcome::Success
    }

    fn copy(&self, desc: &TransferDescriptor, src: &Translation, dst: &Translation) {
        let latency = self.shared.config.segment_latency;
        for segment in desc.segments() {
            // Both translations cover the descriptor's spans.
            unsafe {
                copy_segment(
                    src,
                    segment.src_offset,
                    dst,
                    segment.dst_offset,
                    segment.len,
                )
            };
            if !latency.is_zero() {
                thread::sleep(latency);
            }
        }
    }

    fn immediate(&self, source: EndpointAddress, remote: EndpointAddress, value: u64) -> Outcome {
        let Some(target) = self.shared.ports.resolve(remote) else {
            return Outcome::NoRoute;
        };
        trace!(%source, %remote, value, "delivering immediate");
        target.recv.offer_immediate(value, source)
    }
}
