//! The in-process allocation tracker.
//!
//! One static handle, reachable from interposed allocator entry points with
//! no argument channel. All sampling bookkeeping is thread-local; the shared
//! state behind the mutex is only touched once a sample boundary is crossed.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, Once};

use everprof_events::{
    AllocationSampleWriter, ClearLiveAllocationRecord, DeallocationRecord, LostRecord,
    MpscRingBufferWriter, ReserveError, RingBuffer, SampleId, ALLOCATION_SAMPLE_RECORD_SIZE,
    ALLOCATION_TRACKER_STATE_RECORD_SIZE, CLEAR_LIVE_ALLOCATION_RECORD_SIZE,
    DEALLOCATION_RECORD_SIZE, LOST_RECORD_SIZE, PERF_REGS_COUNT, RESERVE_TIMEOUT,
};

use crate::reentry_guard::ReentryGuard;
use crate::sampler::AllocationSampler;
use crate::save_context::{query_stack_end, save_context};

/// Consecutive spinlock timeouts after which the tracker declares the
/// consumer dead and disables itself permanently.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 16;

/// Live allocations tracked before the tracker asks the aggregator to drop
/// its address map and start over.
pub const MAX_TRACKED_ALLOCATIONS: u64 = 1 << 19;

/// A tracker-state record rides along every so many samples.
const STATE_RECORD_PERIOD: u64 = 256;

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    /// Mean sampled-byte interval.
    pub interval: u64,
    /// Replace the exponential distribution with the fixed interval.
    pub deterministic_sampling: bool,
    /// Emit deallocation records for the free family.
    pub track_deallocations: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub lost_alloc: u64,
    pub lost_dealloc: u64,
    pub consecutive_failures: u32,
    pub tracked_allocations: u64,
    pub pushed_samples: u64,
}

struct TrackerState {
    rb: RingBuffer,
    settings: TrackerSettings,
    sampler: AllocationSampler,
    pid: u32,
    stats: TrackerStats,
    pending_lost: u64,
}

static TRACKING_ENABLED: AtomicBool = AtomicBool::new(false);
static STATE: Mutex<Option<TrackerState>> = Mutex::new(None);
static FORK_HANDLER: Once = Once::new();

struct TlState {
    remaining: Cell<i64>,
    initialized: Cell<bool>,
    tid: Cell<u32>,
    stack_end: Cell<u64>,
    guard: Cell<bool>,
}

thread_local! {
    static TL_STATE: TlState = const {
        TlState {
            remaining: Cell::new(0),
            initialized: Cell::new(false),
            tid: Cell::new(0),
            stack_end: Cell::new(0),
            guard: Cell::new(false),
        }
    };
}

fn lock_state() -> MutexGuard<'static, Option<TrackerState>> {
    STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracking state does not survive a fork: the child inherits the mapping
/// but its records would carry the parent's pid.
extern "C" fn after_fork_in_child() {
    TRACKING_ENABLED.store(false, Ordering::Relaxed);
}

/// Install the ring buffer and arm the tracker. Sampling stays off until
/// [`start`] is called.
pub fn init(rb: RingBuffer, settings: TrackerSettings) {
    FORK_HANDLER.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(after_fork_in_child));
    });
    let pid = unsafe { libc::getpid() } as u32;
    let sampler = AllocationSampler::new(settings.interval, settings.deterministic_sampling);
    *lock_state() = Some(TrackerState {
        rb,
        settings,
        sampler,
        pid,
        stats: TrackerStats::default(),
        pending_lost: 0,
    });
}

pub fn start() {
    if lock_state().is_some() {
        TRACKING_ENABLED.store(true, Ordering::Relaxed);
    }
}

pub fn stop() {
    TRACKING_ENABLED.store(false, Ordering::Relaxed);
}

/// Stop sampling and unmap the ring buffer.
pub fn shutdown() {
    TRACKING_ENABLED.store(false, Ordering::Relaxed);
    *lock_state() = None;
}

pub fn is_active() -> bool {
    TRACKING_ENABLED.load(Ordering::Relaxed)
}

pub fn stats() -> Option<TrackerStats> {
    lock_state().as_ref().map(|state| state.stats)
}

/// Pretend this many live allocations are already tracked. Test hook for
/// exercising the clear-live-allocations cap without pushing 2^19 samples.
#[doc(hidden)]
pub fn preload_tracked_allocations(count: u64) {
    if let Some(state) = lock_state().as_mut() {
        state.stats.tracked_allocations = count;
    }
}

fn disable_locked(guard: &mut MutexGuard<'static, Option<TrackerState>>) {
    TRACKING_ENABLED.store(false, Ordering::Relaxed);
    **guard = None;
}

/// Account one allocation. Cheap unless a sample boundary was crossed.
#[inline]
pub fn track_allocation(addr: u64, size: u64) {
    if !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    TL_STATE.with(|tl| {
        let remaining = tl.remaining.get() + size as i64;
        tl.remaining.set(remaining);
        if remaining >= 0 || !tl.initialized.get() {
            track_allocation_slow(addr, size, tl);
        }
    });
}

fn track_allocation_slow(addr: u64, size: u64, tl: &TlState) {
    let guard = ReentryGuard::new(&tl.guard);
    if !guard.armed() {
        // The tracker's own allocation: keep the byte budget honest so the
        // next user allocation is not over-attributed, but never sample it.
        tl.remaining.set(tl.remaining.get() - size as i64);
        return;
    }

    // Cache per-thread identity up front; pthread_getattr_np allocates and
    // must not run under an inner allocator call.
    if tl.stack_end.get() == 0 {
        tl.stack_end.set(query_stack_end());
    }
    if tl.tid.get() == 0 {
        tl.tid.set(unsafe { libc::gettid() } as u32);
    }

    let mut state_guard = lock_state();
    let Some(state) = state_guard.as_mut() else {
        return;
    };

    let mut remaining = tl.remaining.get();
    if !tl.initialized.get() {
        remaining -= state.sampler.next_sample_interval();
        tl.initialized.set(true);
        if remaining < 0 {
            tl.remaining.set(remaining);
            return;
        }
    }
    if remaining < 0 {
        tl.remaining.set(remaining);
        return;
    }

    let (reported, rest) = state.sampler.cross_boundaries(remaining);
    tl.remaining.set(rest);

    if state.push_allocation_sample(addr, reported, tl) {
        log::warn!("allocation tracker disabled after {MAX_CONSECUTIVE_FAILURES} stale-lock timeouts");
        disable_locked(&mut state_guard);
    }
}

/// Account one deallocation; emits a record carrying only the pointer.
#[inline]
pub fn track_deallocation(ptr: u64) {
    if ptr == 0 || !TRACKING_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    TL_STATE.with(|tl| {
        let guard = ReentryGuard::new(&tl.guard);
        if !guard.armed() {
            return;
        }
        if tl.tid.get() == 0 {
            tl.tid.set(unsafe { libc::gettid() } as u32);
        }
        let mut state_guard = lock_state();
        let Some(state) = state_guard.as_mut() else {
            return;
        };
        if !state.settings.track_deallocations {
            return;
        }
        if state.push_deallocation(ptr, tl) {
            log::warn!(
                "allocation tracker disabled after {MAX_CONSECUTIVE_FAILURES} stale-lock timeouts"
            );
            disable_locked(&mut state_guard);
        }
    });
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl TrackerState {
    fn sample_id(&self, tl: &TlState, time: u64) -> SampleId {
        SampleId {
            pid: self.pid,
            tid: tl.tid.get(),
            time,
        }
    }

    /// Returns true when the tracker must disable itself.
    fn push_allocation_sample(&mut self, addr: u64, period: u64, tl: &TlState) -> bool {
        let time = monotonic_ns();
        let writer = MpscRingBufferWriter::new(&self.rb);

        if self.settings.track_deallocations
            && self.stats.tracked_allocations >= MAX_TRACKED_ALLOCATIONS
        {
            let clear_result = match writer.reserve(CLEAR_LIVE_ALLOCATION_RECORD_SIZE, RESERVE_TIMEOUT) {
                Ok(mut reservation) => {
                    ClearLiveAllocationRecord {
                        sample_id: self.sample_id(tl, time),
                    }
                    .write_record(reservation.bytes());
                    reservation.commit();
                    Ok(())
                }
                Err(err) => Err(err),
            };
            match clear_result {
                Ok(()) => self.stats.tracked_allocations = 0,
                Err(err) => return self.note_failure(err, false),
            }
        }

        if self.pending_lost > 0 {
            if let Ok(mut reservation) = writer.reserve(LOST_RECORD_SIZE, RESERVE_TIMEOUT) {
                LostRecord {
                    id: 0,
                    lost: self.pending_lost,
                }
                .write_record(reservation.bytes());
                reservation.commit();
                self.pending_lost = 0;
            }
        }

        let result = match writer.reserve(ALLOCATION_SAMPLE_RECORD_SIZE, RESERVE_TIMEOUT) {
            Ok(mut reservation) => {
                {
                    let mut sample = AllocationSampleWriter::new(reservation.bytes());
                    sample.set_identity(self.pid, tl.tid.get(), time);
                    sample.set_addr(addr);
                    sample.set_cpu(unsafe { libc::sched_getcpu().max(0) } as u32);
                    sample.set_period(period);
                    let mut regs = [0u64; PERF_REGS_COUNT];
                    let dyn_size =
                        save_context(&mut regs, sample.stack_bytes(), tl.stack_end.get());
                    sample.set_regs(&regs);
                    sample.set_dyn_size(dyn_size);
                }
                reservation.commit();
                self.rb.notify();

                self.stats.consecutive_failures = 0;
                if self.settings.track_deallocations {
                    self.stats.tracked_allocations += 1;
                }
                self.stats.pushed_samples += 1;
                let should_push_state = self.stats.pushed_samples % STATE_RECORD_PERIOD == 0;
                Ok(should_push_state)
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(should_push_state) => {
                if should_push_state {
                    self.push_state_record(tl, time);
                }
                false
            }
            Err(err) => self.note_failure(err, false),
        }
    }

    fn push_deallocation(&mut self, ptr: u64, tl: &TlState) -> bool {
        let time = monotonic_ns();
        let writer = MpscRingBufferWriter::new(&self.rb);
        let result = match writer.reserve(DEALLOCATION_RECORD_SIZE, RESERVE_TIMEOUT) {
            Ok(mut reservation) => {
                DeallocationRecord {
                    sample_id: self.sample_id(tl, time),
                    ptr,
                }
                .write_record(reservation.bytes());
                reservation.commit();
                Ok(())
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                self.rb.notify();
                self.stats.consecutive_failures = 0;
                self.stats.tracked_allocations = self.stats.tracked_allocations.saturating_sub(1);
                false
            }
            Err(err) => self.note_failure(err, true),
        }
    }

    fn push_state_record(&mut self, tl: &TlState, time: u64) {
        let writer = MpscRingBufferWriter::new(&self.rb);
        if let Ok(mut reservation) =
            writer.reserve(ALLOCATION_TRACKER_STATE_RECORD_SIZE, RESERVE_TIMEOUT)
        {
            everprof_events::AllocationTrackerStateRecord {
                sample_id: self.sample_id(tl, time),
                tracked_count: self.stats.tracked_allocations,
                lost_alloc: self.stats.lost_alloc,
                lost_dealloc: self.stats.lost_dealloc,
            }
            .write_record(reservation.bytes());
            reservation.commit();
        }
    }

    fn note_failure(&mut self, err: ReserveError, dealloc: bool) -> bool {
        if dealloc {
            self.stats.lost_dealloc += 1;
        } else {
            self.stats.lost_alloc += 1;
        }
        self.pending_lost += 1;
        match err {
            ReserveError::StaleLock => {
                self.stats.consecutive_failures += 1;
                self.stats.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
            }
            ReserveError::Full => false,
        }
    }
}
