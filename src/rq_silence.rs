//! Ring-observed silence counter.
//!
//! The one mutable field shared between a node's token loop and its activity
//! listener thread. Both sides go through the operations here; every
//! read-modify-write is a single critical section behind one lock, so an
//! increment can never be interleaved with a reset ("lost update").

use std::sync::{Arc, Mutex};

/// Count of consecutive silent hops, as observed by one node.
///
/// Advanced by the node's own token-processing step and reset asynchronously
/// by the listener whenever any node in the ring announces an activity event.
/// Cloning shares the underlying cell.
#[derive(Clone, Default)]
pub struct SilenceCounter {
    inner: Arc<Mutex<u64>>,
}

impl SilenceCounter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(0)),
        }
    }

    /// Reset to zero. Idempotent: resetting an already-zero counter is a
    /// no-op, which is what makes late-arriving activity records harmless.
    pub fn reset(&self) {
        let mut count = self.inner.lock().expect("silence counter poisoned");
        *count = 0;
    }

    /// Synchronize with the ring-wide count carried by an incoming token.
    ///
    /// Events only ever happen at the token holder, so the count on the
    /// token is exact at receipt; the cell may hold a stale value from a
    /// broadcast reset heard between visits. Overwriting is safe - a reset
    /// arriving after this point can only delay detection, never fake it.
    pub fn adopt(&self, observed: u64) {
        let mut count = self.inner.lock().expect("silence counter poisoned");
        *count = observed;
    }

    /// Record one silent hop and return the new count.
    pub fn record_silent_hop(&self) -> u64 {
        let mut count = self.inner.lock().expect("silence counter poisoned");
        *count += 1;
        *count
    }

    /// Snapshot the current count in a single critical section.
    ///
    /// The terminal comparison against the threshold is made from this
    /// snapshot; a concurrent reset landing afterwards is tolerated because
    /// detection only has to be eventual, not hop-exact.
    pub fn observe(&self) -> u64 {
        *self.inner.lock().expect("silence counter poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_reset_is_idempotent() {
        let counter = SilenceCounter::new();
        assert_eq!(counter.observe(), 0);

        counter.reset();
        assert_eq!(counter.observe(), 0);

        counter.record_silent_hop();
        counter.reset();
        counter.reset();
        assert_eq!(counter.observe(), 0);
    }

    #[test]
    fn test_increment_returns_new_count() {
        let counter = SilenceCounter::new();
        assert_eq!(counter.record_silent_hop(), 1);
        assert_eq!(counter.record_silent_hop(), 2);
        assert_eq!(counter.record_silent_hop(), 3);
        assert_eq!(counter.observe(), 3);
    }

    #[test]
    fn test_adopt_overwrites_stale_view() {
        let counter = SilenceCounter::new();
        counter.record_silent_hop();
        counter.record_silent_hop();

        counter.adopt(7);
        assert_eq!(counter.observe(), 7);

        counter.adopt(0);
        assert_eq!(counter.observe(), 0);
    }

    #[test]
    fn test_clones_share_the_cell() {
        let counter = SilenceCounter::new();
        let listener_view = counter.clone();

        counter.record_silent_hop();
        counter.record_silent_hop();
        assert_eq!(listener_view.observe(), 2);

        listener_view.reset();
        assert_eq!(counter.observe(), 0);
    }

    #[test]
    fn test_no_lost_updates_under_contention() {
        let counter = SilenceCounter::new();

        let incrementer = {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    counter.record_silent_hop();
                }
            })
        };
        let resetter = {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    counter.reset();
                }
            })
        };

        incrementer.join().unwrap();
        resetter.join().unwrap();

        // After both sides quiesce the count is whatever survived the last
        // reset - bounded by the total increments, never torn or negative.
        assert!(counter.observe() <= 1000);

        counter.reset();
        assert_eq!(counter.observe(), 0);
        assert_eq!(counter.record_silent_hop(), 1);
    }
}
