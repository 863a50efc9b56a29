use std::mem;
use std::time::Duration;

use everprof_agent::{tracker, TrackerSettings, MAX_CONSECUTIVE_FAILURES};
use everprof_events::{RingBuffer, RingBufferKind, SpinLock};

/// With the spinlock held externally and never released, the first sixteen
/// samples fail to reserve and are counted; the tracker then disables itself
/// and later allocations return without touching the buffer.
#[test]
fn stale_lock_disables_the_tracker() {
    let rb = RingBuffer::create(6, RingBufferKind::Mpsc).unwrap();

    // Simulate a producer that died while holding the lock.
    let held = SpinLock::new(rb.mpsc_spinlock())
        .try_lock(Duration::from_millis(10))
        .unwrap();
    mem::forget(held);

    tracker::init(
        rb,
        TrackerSettings {
            interval: 1,
            deterministic_sampling: true,
            track_deallocations: false,
        },
    );
    tracker::start();

    for i in 0..MAX_CONSECUTIVE_FAILURES as u64 {
        assert!(tracker::is_active(), "disabled after only {i} failures");
        tracker::track_allocation(0x1000 + i * 0x10, 1);
        if i + 1 < MAX_CONSECUTIVE_FAILURES as u64 {
            let stats = tracker::stats().unwrap();
            assert_eq!(stats.consecutive_failures, i as u32 + 1);
            assert_eq!(stats.lost_alloc, i + 1);
        }
    }

    assert!(!tracker::is_active());
    // The disable is irrevocable: state is gone and further allocations are
    // no-ops.
    assert!(tracker::stats().is_none());
    tracker::track_allocation(0x9000, 1);
    assert!(!tracker::is_active());
}
