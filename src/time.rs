//! Time-based waiting.

use std::cell::Cell;
use std::thread;
use std::time::{Duration, Instant};

/// Blocks the whole OS thread for `ms` milliseconds. Does not yield:
/// every coroutine in the ring stalls together.
pub fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// Yields repeatedly until at least `ms` milliseconds of wall-clock time
/// have passed.
pub fn wait(ms: u64) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    crate::when!(Instant::now() >= deadline);
}

/// Like [wait], but returns early once `continuing` goes false, or once
/// `canceling` (when present) goes true. The flags are [Cell]s because
/// peer coroutines on the same thread write them between yields.
pub fn wait_ex(ms: u64, continuing: &Cell<bool>, canceling: Option<&Cell<bool>>) {
    let deadline = Instant::now() + Duration::from_millis(ms);
    crate::when!(
        Instant::now() >= deadline
            || !continuing.get()
            || canceling.map_or(false, Cell::get)
    );
}
