//! Thread pinning for scenario runs.

use tracing::{info, warn};

/// CPU the calling thread is currently running on, if the platform reports it.
pub fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    (cpu >= 0).then_some(cpu as usize)
}

/// Pin the calling thread to `core_id`.
///
/// Returns the CPU the thread runs on afterwards. A core that does not exist
/// on this machine is reported and left unpinned.
pub fn pin_current(core_id: usize) -> Option<usize> {
    let available = core_affinity::get_core_ids().unwrap_or_default();
    if !available.iter().any(|core| core.id == core_id) {
        warn!(
            core_id,
            available = available.len(),
            "core not available, thread left unpinned"
        );
        return current_cpu();
    }

    if core_affinity::set_for_current(core_affinity::CoreId { id: core_id }) {
        let cpu = current_cpu();
        info!(core_id, ?cpu, "thread pinned");
        cpu
    } else {
        warn!(core_id, "failed to pin thread");
        current_cpu()
    }
}
