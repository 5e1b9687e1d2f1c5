//! Memory barrier macros for DMA issue and completion.
//!
//! A full barrier is required on both edges of a transfer: before issue, so
//! stores made by software are visible to the engine, and after a completion
//! is confirmed, so bytes delivered by the engine are visible to software.

/// Full memory barrier.
///
/// Orders all prior loads and stores against all later ones, for both the
/// compiler and the CPU.
/// On x86_64, issues `mfence`.
/// On ARM64, uses `dmb ish`.
macro_rules! dma_fence {
    () => {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_mfence();
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb ish", options(nostack, preserves_flags));
        }
    };
}
