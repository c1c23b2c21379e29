//! Thread-local home of the kernel handle.
//!
//! Each thread runs at most one ring at a time; `cobegin` installs the
//! kernel for its own duration. The kernel is boxed so raw pointers into
//! it (the resume record handed to the restore tail) stay stable across
//! borrows.

use std::cell::RefCell;

use super::Kernel;

thread_local! {
    static KERNEL: RefCell<Option<Box<Kernel>>> = const { RefCell::new(None) };
}

/// True while a ring is running on this thread.
pub(super) fn installed() -> bool {
    KERNEL.with(|cell| cell.borrow().is_some())
}

pub(super) fn install(kernel: Box<Kernel>) {
    KERNEL.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(slot.is_none(), "ring already running on this thread");
        *slot = Some(kernel);
    });
}

pub(super) fn uninstall() -> Box<Kernel> {
    KERNEL.with(|cell| cell.borrow_mut().take().expect("no ring on this thread"))
}

/// Runs a closure against the active kernel. The closure must not reach a
/// yield point: the borrow is held for its duration.
pub(super) fn with<T>(f: impl FnOnce(&mut Kernel) -> T) -> T {
    KERNEL.with(|cell| {
        let mut slot = cell.borrow_mut();
        let kernel = slot.as_mut().expect("no ring on this thread");
        f(kernel)
    })
}

/// Like [with], but `None` when no ring is running.
pub(super) fn try_with<T>(f: impl FnOnce(&mut Kernel) -> T) -> Option<T> {
    KERNEL.with(|cell| {
        let mut slot = cell.borrow_mut();
        slot.as_mut().map(|kernel| f(kernel))
    })
}
