//! Completion state machine.
//!
//! The receive side has one tracking slot per context:
//!
//! ```text
//! IDLE ──arm──► ARMED ──first byte──► PENDING ──resolve──► SUCCESS | NACK | NO_ROUTE
//!                 │                                            │
//!                 └──────────────reject / unbind───────────────┘
//!                                  (terminal until the next arm)
//! ```
//!
//! The send side counts outstanding operations and latches the first error
//! seen since it was last quiescent.
//!
//! Both trackers publish their state through a single atomic so `poll` is
//! lock-free. Every transition is made while holding the tracker's mutex so a
//! blocked waiter cannot miss the wake-up.

use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::types::{EndpointAddress, Outcome, RecvStatus, SendStatus};

// =============================================================================
// Completion State
// =============================================================================

/// Observable state of the receive tracking slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionState {
    /// Nothing armed.
    Idle,
    /// Armed; no matching transfer has arrived.
    Armed,
    /// A matching transfer is in flight.
    Pending,
    /// Resolved. Stays here until the next arm.
    Done(Outcome),
}

const STATE_IDLE: u8 = 0xF0;
const STATE_ARMED: u8 = 0xF1;
const STATE_PENDING: u8 = 0xF2;

impl CompletionState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Idle => STATE_IDLE,
            Self::Armed => STATE_ARMED,
            Self::Pending => STATE_PENDING,
            Self::Done(outcome) => outcome as u8,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_IDLE => Self::Idle,
            STATE_ARMED => Self::Armed,
            STATE_PENDING => Self::Pending,
            other => Outcome::from_u8(other).map_or(Self::Idle, Self::Done),
        }
    }

    /// `true` when a wait has nothing more to wait for.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Idle | Self::Done(_))
    }

    /// Receive-side status code for this state.
    pub fn recv_status(self) -> RecvStatus {
        match self {
            Self::Idle | Self::Armed => RecvStatus::NotStarted,
            Self::Pending => RecvStatus::NotFinished,
            Self::Done(outcome) => outcome.into(),
        }
    }
}

/// What the receive slot is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    /// The next PUT landing inside `[addr, addr + capacity)`.
    Buffer { addr: u64, capacity: usize },
    /// The next immediate message.
    Immediate,
}

/// How an inbound PUT relates to the armed registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutAdmission {
    /// Not covered by the armed buffer; deliver without touching the slot.
    Untracked,
    /// Covered by the armed buffer; the slot is now pending.
    Tracked(u64),
    /// Overlaps the armed buffer but does not fit in it.
    Rejected,
}

// =============================================================================
// Receive Tracker
// =============================================================================

struct RecvInner {
    tracking: Option<Tracking>,
    immediate: Option<u64>,
    source: Option<EndpointAddress>,
    generation: u64,
}

/// Receive-side tracking slot of one context.
pub struct RecvTracker {
    state: AtomicU8,
    inner: Mutex<RecvInner>,
    cond: Condvar,
}

impl Default for RecvTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            inner: Mutex::new(RecvInner {
                tracking: None,
                immediate: None,
                source: None,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Current state. Lock-free; safe to call at any rate.
    #[inline]
    pub fn state(&self) -> CompletionState {
        CompletionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn poll(&self) -> RecvStatus {
        self.state().recv_status()
    }

    fn set(&self, state: CompletionState) {
        self.state.store(state.to_u8(), Ordering::Release);
        self.cond.notify_all();
    }

    /// Arm the slot for the next matching transfer or immediate.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyArmed`] while a previous registration is
    /// armed or in flight.
    pub fn arm(&self, tracking: Tracking) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(self.state(), CompletionState::Armed | CompletionState::Pending) {
            return Err(Error::AlreadyArmed);
        }
        inner.tracking = Some(tracking);
        inner.immediate = None;
        inner.generation += 1;
        self.set(CompletionState::Armed);
        Ok(())
    }

    /// Resolve an unresolved registration with `NoRoute`.
    ///
    /// Called when the context loses its address. Returns `true` if a
    /// registration was resolved.
    pub fn abandon(&self) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(self.state(), CompletionState::Armed | CompletionState::Pending) {
            return false;
        }
        inner.tracking = None;
        inner.generation += 1;
        self.set(CompletionState::Done(Outcome::NoRoute));
        true
    }

    /// Offer an inbound immediate. Accepted only when armed for immediates.
    pub fn offer_immediate(&self, value: u64, source: EndpointAddress) -> Outcome {
        let mut inner = self.inner.lock();
        if self.state() != CompletionState::Armed || inner.tracking != Some(Tracking::Immediate) {
            return Outcome::Nack;
        }
        inner.tracking = None;
        inner.immediate = Some(value);
        inner.source = Some(source);
        self.set(CompletionState::Done(Outcome::Success));
        Outcome::Success
    }

    /// Classify an inbound PUT by its destination footprint.
    ///
    /// On [`PutAdmission::Tracked`] the slot moves to `Pending`; on
    /// [`PutAdmission::Rejected`] it resolves to `Nack`.
    pub fn admit_put(&self, footprint: Range<u64>) -> PutAdmission {
        let mut inner = self.inner.lock();
        let Some(Tracking::Buffer { addr, capacity }) = inner.tracking else {
            return PutAdmission::Untracked;
        };
        if self.state() != CompletionState::Armed {
            return PutAdmission::Untracked;
        }

        let tracked = addr..addr.saturating_add(capacity as u64);
        let inside = if footprint.is_empty() {
            tracked.contains(&footprint.start)
        } else {
            footprint.start >= tracked.start && footprint.end <= tracked.end
        };
        let overlaps = footprint.start < tracked.end && tracked.start < footprint.end;

        if inside {
            self.set(CompletionState::Pending);
            PutAdmission::Tracked(inner.generation)
        } else if overlaps {
            inner.tracking = None;
            self.set(CompletionState::Done(Outcome::Nack));
            PutAdmission::Rejected
        } else {
            PutAdmission::Untracked
        }
    }

    /// Resolve a tracked PUT admitted under `generation`.
    ///
    /// Ignored if the slot has since been resolved by another path.
    pub fn finish_put(&self, generation: u64, outcome: Outcome, source: EndpointAddress) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || self.state() != CompletionState::Pending {
            return;
        }
        inner.tracking = None;
        inner.source = Some(source);
        self.set(CompletionState::Done(outcome));
    }

    /// Take the delivered immediate. Returns it once per arm cycle.
    pub fn take_immediate(&self) -> Option<u64> {
        self.inner.lock().immediate.take()
    }

    /// Sender of the last completed tracked receive.
    pub fn source(&self) -> Option<EndpointAddress> {
        self.inner.lock().source
    }

    /// Block until the state differs from `observed` or `timeout` elapses.
    pub fn block(&self, observed: CompletionState, timeout: Duration) {
        let mut inner = self.inner.lock();
        if self.state() == observed {
            self.cond.wait_for(&mut inner, timeout);
        }
    }
}

// =============================================================================
// Send Tracker
// =============================================================================

const NO_ERROR: u64 = 0xFF;

#[inline]
fn pack(outstanding: u32, error: u64) -> u64 {
    (error << 32) | outstanding as u64
}

#[inline]
fn unpack(v: u64) -> (u32, u64) {
    (v as u32, v >> 32)
}

/// Send-side completion tracking of one context.
pub struct SendTracker {
    /// `[error:8][outstanding:32]`
    state: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for SendTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SendTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(pack(0, NO_ERROR)),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Current status. Lock-free; safe to call at any rate.
    #[inline]
    pub fn poll(&self) -> SendStatus {
        let (outstanding, error) = unpack(self.state.load(Ordering::Acquire));
        if outstanding > 0 {
            return SendStatus::NotFinished;
        }
        Outcome::from_u8(error as u8).map_or(SendStatus::Success, SendStatus::from)
    }

    /// Number of issued operations not yet resolved.
    pub fn outstanding(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Record a newly issued operation.
    ///
    /// Issuing from a quiescent state clears the latched error.
    pub fn begin(&self) {
        let _guard = self.lock.lock();
        let (outstanding, error) = unpack(self.state.load(Ordering::Relaxed));
        let next = if outstanding == 0 {
            pack(1, NO_ERROR)
        } else {
            pack(outstanding + 1, error)
        };
        self.state.store(next, Ordering::Release);
    }

    /// Resolve one outstanding operation.
    pub fn complete(&self, outcome: Outcome) {
        let _guard = self.lock.lock();
        let (outstanding, error) = unpack(self.state.load(Ordering::Relaxed));
        debug_assert!(outstanding > 0, "send completion without an issue");
        let error = if error == NO_ERROR && outcome != Outcome::Success {
            outcome as u64
        } else {
            error
        };
        self.state
            .store(pack(outstanding.saturating_sub(1), error), Ordering::Release);
        self.cond.notify_all();
    }

    /// Block while operations are outstanding, at most `timeout`.
    pub fn block(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        if self.outstanding() > 0 {
            self.cond.wait_for(&mut guard, timeout);
        }
    }
}

// =============================================================================
// Hybrid Wait
// =============================================================================

/// Spin on `poll` up to `spin_bound` times, then alternate `block` and `poll`
/// until `poll` reports a settled status.
///
/// `poll` returns the status and whether it is settled; `block` receives the
/// last unsettled status and should return once the channel signals progress.
pub fn spin_then_block<S: Copy>(
    spin_bound: u32,
    mut poll: impl FnMut() -> (S, bool),
    mut block: impl FnMut(S),
) -> S {
    for _ in 0..spin_bound {
        let (status, settled) = poll();
        if settled {
            return status;
        }
        std::hint::spin_loop();
    }

    loop {
        let (status, settled) = poll();
        if settled {
            return status;
        }
        block(status);
    }
}
