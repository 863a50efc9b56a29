//! In-process allocation tracking agent.
//!
//! Loaded into the target process (the loader is not part of this crate),
//! the agent asks the out-of-process profiler for a shared MPSC ring buffer,
//! samples allocations at a Poisson-thinned byte rate, and writes
//! perf-record look-alikes into the buffer. The profiler's event pump
//! consumes them like any kernel sample.

mod attach;
#[cfg(feature = "interpose")]
pub mod hooks;
mod reentry_guard;
mod sampler;
mod save_context;
pub mod tracker;

pub use attach::{attach_to_profiler, AttachError};
pub use reentry_guard::ReentryGuard;
pub use sampler::AllocationSampler;
pub use save_context::{query_stack_end, save_context};
pub use tracker::{
    TrackerSettings, TrackerStats, MAX_CONSECUTIVE_FAILURES, MAX_TRACKED_ALLOCATIONS,
};

use std::ffi::{c_char, CStr};
use std::path::Path;

/// Flag bits accepted by [`everprof_allocation_tracking_start`].
pub const TRACKING_FLAG_DETERMINISTIC: u32 = 1;
pub const TRACKING_FLAG_DEALLOCATIONS: u32 = 2;

/// C entry point for the loader: connect to the profiler's socket, map the
/// ring buffer, and start sampling. Returns 0 on success.
///
/// # Safety
///
/// `socket_path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn everprof_allocation_tracking_start(
    socket_path: *const c_char,
    flags: u32,
) -> i32 {
    if socket_path.is_null() {
        return -1;
    }
    let Ok(path) = CStr::from_ptr(socket_path).to_str() else {
        return -1;
    };
    match start_tracking(Path::new(path), flags) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("allocation tracking init failed: {err}");
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn everprof_allocation_tracking_stop() {
    tracker::shutdown();
}

fn start_tracking(path: &Path, flags: u32) -> Result<(), AttachError> {
    let (rb, interval) =
        attach_to_profiler(path, everprof_events::DEFAULT_SOCKET_TIMEOUT)?;
    tracker::init(
        rb,
        TrackerSettings {
            interval,
            deterministic_sampling: flags & TRACKING_FLAG_DETERMINISTIC != 0,
            track_deallocations: flags & TRACKING_FLAG_DEALLOCATIONS != 0,
        },
    );
    tracker::start();
    Ok(())
}
