//! Cross-module test helpers shared by this crate's `#[cfg(test)]` modules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fails the test on `Drop` if a panic occurred anywhere in the process
/// while this was alive. By default a panic on a thread other than the
/// test's own (e.g. inside a `tokio::spawn`ed watcher task) is swallowed
/// and the test still passes; constructing one of these in a test that
/// spawns detached tasks makes such a panic fail the test instead.
pub struct AsyncPanicChecker {
    flag: Arc<AtomicBool>,
}

impl Drop for AsyncPanicChecker {
    fn drop(&mut self) {
        assert!(!self.flag.load(Ordering::Relaxed));
    }
}

impl Default for AsyncPanicChecker {
    fn default() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let async_panic = Arc::clone(&flag);
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            async_panic.store(true, Ordering::Relaxed);
        }));
        Self { flag }
    }
}
