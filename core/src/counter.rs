use std::sync::atomic::{AtomicI64, AtomicBool, Ordering};

/// A monotonic, race-free integer source. `next()` never blocks longer
/// than it takes to increment an atomic; `stop()` makes every subsequent
/// `next()` return the sentinel `0` instead of panicking.
///
/// Overflow is not handled: callers assume a 63-bit range.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
    stopped: AtomicBool,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starting the counter at `start` is useful when recovering from a
    /// persisted high-water mark.
    pub fn starting_at(start: i64) -> Self {
        Self {
            value: AtomicI64::new(start),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn next(&self) -> i64 {
        if self.stopped.load(Ordering::SeqCst) {
            return 0;
        }
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_strictly_increasing() {
        let counter = Counter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
    }

    #[test]
    fn test_next_after_stop_returns_zero() {
        let counter = Counter::new();
        counter.next();
        counter.stop();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_starting_at_resumes_sequence() {
        let counter = Counter::starting_at(41);
        assert_eq!(counter.next(), 42);
    }

    #[test]
    fn test_concurrent_next_never_duplicates() {
        use std::sync::Arc;
        use std::thread;

        let counter = Arc::new(Counter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                (0..100).map(|_| counter.next()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
