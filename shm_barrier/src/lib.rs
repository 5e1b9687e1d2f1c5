//! Named, process-shared N-party barrier.
//!
//! Sequences test phases across threads or forked processes. The barrier
//! lives in a named `/dev/shm` object and is sense-reversing: each arrival
//! increments a shared count, and the last of `n` arrivals resets the count
//! and flips a shared cycle word that everyone else is waiting on.
//!
//! ```text
//! offset  field
//! 0       magic   u32
//! 4       parties u32
//! 8       count   AtomicU32
//! 12      cycle   AtomicU32
//! 16..64  padding
//! ```

pub mod shm;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use shm::SharedMemory;
use tracing::debug;

/// Spin iterations before a waiter starts yielding its CPU.
const SPIN_LIMIT: u32 = 1 << 12;

const MAGIC: u32 = 0x4241_5252; // "BARR"

#[repr(C, align(64))]
struct Header {
    magic: u32,
    parties: u32,
    count: AtomicU32,
    cycle: AtomicU32,
}

const HEADER_SIZE: usize = size_of::<Header>();

/// A mapping of a named barrier.
pub struct Barrier {
    shm: SharedMemory,
    parties: u32,
}

impl Barrier {
    /// Create the barrier `name` for `parties` participants and reset it.
    ///
    /// An existing object with the same name is reused and reinitialised.
    pub fn init<P: AsRef<Path>>(name: P, parties: u32) -> io::Result<Self> {
        if parties == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a barrier needs at least one party",
            ));
        }
        let shm = SharedMemory::create(name.as_ref(), HEADER_SIZE)?;

        let header = shm.as_ptr() as *mut Header;
        // No other party may use the barrier before init returns.
        unsafe {
            header.write(Header {
                magic: MAGIC,
                parties,
                count: AtomicU32::new(0),
                cycle: AtomicU32::new(0),
            });
        }
        std::sync::atomic::fence(Ordering::Release);

        debug!(name = %name.as_ref().display(), parties, "barrier initialised");
        Ok(Self { shm, parties })
    }

    /// Map the existing barrier `name`, expecting `parties` participants.
    ///
    /// Fails with `InvalidData` if the object is not a barrier or was created
    /// for a different number of parties.
    pub fn open<P: AsRef<Path>>(name: P, parties: u32) -> io::Result<Self> {
        let shm = SharedMemory::open(name.as_ref(), HEADER_SIZE)?;
        std::sync::atomic::fence(Ordering::Acquire);

        let header = unsafe { &*(shm.as_ptr() as *const Header) };
        if header.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad barrier magic {:#x}", header.magic),
            ));
        }
        if header.parties != parties {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "barrier expects {} parties, opened for {}",
                    header.parties, parties
                ),
            ));
        }
        Ok(Self { shm, parties })
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.shm.as_ptr() as *const Header) }
    }

    /// Number of participants.
    pub fn parties(&self) -> u32 {
        self.parties
    }

    /// Block until all parties have called `wait` for the current cycle.
    pub fn wait(&self) -> io::Result<()> {
        let header = self.header();
        let cycle = header.cycle.load(Ordering::Acquire);

        let arrived = header.count.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived > self.parties {
            return Err(io::Error::other(format!(
                "{} arrivals at a barrier for {} parties",
                arrived, self.parties
            )));
        }
        if arrived == self.parties {
            header.count.store(0, Ordering::Relaxed);
            header.cycle.store(cycle.wrapping_add(1), Ordering::Release);
            return Ok(());
        }

        let mut spins = 0u32;
        while header.cycle.load(Ordering::Acquire) == cycle {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Unmap the barrier. The name stays until [`Barrier::unlink`].
    pub fn close(self) -> io::Result<()> {
        self.shm.close()
    }

    /// Remove the barrier's name.
    pub fn unlink<P: AsRef<Path>>(name: P) -> io::Result<()> {
        SharedMemory::unlink(name)
    }
}
