//! Process memory locking and realtime capability probing.
//!
//! When the active profile requests raised priority the process pins its
//! current and future pages on enable and releases them on disable.
//! Failure is logged and never fatal.

use tracing::{debug, info};

/// Attempt to pin all current and future pages. Returns whether the lock
/// is held.
#[cfg(unix)]
pub fn lock_all_memory() -> bool {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        debug!("memory locked");
        true
    } else {
        info!("could not lock memory, continuing without");
        false
    }
}

/// Memory locking is unavailable off unix.
#[cfg(not(unix))]
pub fn lock_all_memory() -> bool {
    info!("memory locking not available on this platform");
    false
}

/// Release a lock taken by [`lock_all_memory`].
#[cfg(unix)]
pub fn unlock_all_memory() {
    // SAFETY: munlockall has no memory-safety preconditions.
    let ret = unsafe { libc::munlockall() };
    if ret == 0 {
        debug!("memory unlocked");
    } else {
        info!("could not unlock memory");
    }
}

/// No-op off unix.
#[cfg(not(unix))]
pub fn unlock_all_memory() {}

/// Ask the kernel for FIFO scheduling at `priority`. Returns whether the
/// request was granted; refusal is logged and never fatal.
#[cfg(unix)]
pub fn set_rt_priority(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: sched_setscheduler reads the param struct we pass.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret == 0 {
        debug!(priority, "FIFO scheduling enabled");
        true
    } else {
        info!(priority, "could not enable FIFO scheduling, continuing");
        false
    }
}

/// No FIFO scheduling off unix.
#[cfg(not(unix))]
pub fn set_rt_priority(_priority: i32) -> bool {
    false
}

/// Whether realtime scheduling (memory locking + FIFO priority) looks
/// available to this process: either root, or a non-zero RLIMIT_RTPRIO.
#[cfg(unix)]
pub fn has_rt_caps() -> bool {
    // SAFETY: geteuid has no preconditions; getrlimit writes into the
    // zeroed struct we hand it.
    unsafe {
        if libc::geteuid() == 0 {
            return true;
        }
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::getrlimit(libc::RLIMIT_RTPRIO, &mut limit) == 0 && limit.rlim_cur > 0
    }
}

/// No realtime scheduling off unix.
#[cfg(not(unix))]
pub fn has_rt_caps() -> bool {
    false
}
