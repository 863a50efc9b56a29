use std::cell::Cell;

/// Per-thread reentrancy latch. Allocations performed while the tracker is
/// doing its own work must not be attributed to the target.
pub struct ReentryGuard<'a> {
    cell: &'a Cell<bool>,
    armed: bool,
}

impl<'a> ReentryGuard<'a> {
    pub fn new(cell: &'a Cell<bool>) -> Self {
        let armed = !cell.get();
        cell.set(true);
        ReentryGuard { cell, armed }
    }

    /// False when the guard was already held further up the call stack.
    pub fn armed(&self) -> bool {
        self.armed
    }
}

impl Drop for ReentryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cell.set(false);
        }
    }
}
