//! The ring scheduler.
//!
//! Exactly one coroutine is live on the OS thread's stack at any instant;
//! every other coroutine exists only as a packed image in the storage
//! area. A yield parks the live frame at the bottom of the area and
//! materializes the image at the top, so the coroutine that has waited
//! longest runs next. A returning entry point lands in the cleanup
//! trampoline, which either picks the next image or unwinds to the host.
//!
//! All scheduler state lives in one [Kernel] value, created per `cobegin`
//! and installed in thread-local storage, so separate threads (and unit
//! tests) run isolated rings.

mod arena;
mod context_switch;
mod image;
mod tls;

use std::{mem, ptr, slice};

use arena::{Arena, Descriptor, CSA_WORDS};
use context_switch::Resume;

use crate::{Coro, Word};

/// Virgin argument counts must fit the descriptor's 7-bit argc field.
const MAX_ARGC: usize = 127;

pub(crate) struct Kernel {
    csa: Arena,
    /// Frame anchor under the host continuation; every live coroutine's
    /// image ends two words below it.
    ring_base: *mut Word,
    /// Bottom of the host's saved registers, popped when the ring empties.
    host_rsp: *mut Word,
    /// Suspended images plus the live coroutine.
    live: usize,
    /// Coroutines handed to `cobegin`, spawned once the ring base is known.
    pending: Vec<Pending>,
    resume: Resume,
}

struct Pending {
    entry: *const (),
    args: Vec<Word>,
}

impl Kernel {
    fn new(ring: &[Coro]) -> Box<Kernel> {
        let csa = Arena::new(CSA_WORDS)
            .unwrap_or_else(|error| fatal(&format!("storage area allocation failed: {error}")));

        Box::new(Kernel {
            csa,
            ring_base: ptr::null_mut(),
            host_rsp: ptr::null_mut(),
            live: 0,
            pending: ring
                .iter()
                .map(|coroutine| Pending {
                    entry: coroutine.entry,
                    args: coroutine.args.clone(),
                })
                .collect(),
            resume: Resume::idle(),
        })
    }

    /// Pushes a virgin image at the top; it runs before everything stored.
    fn spawn(&mut self, entry: *const (), args: &[Word]) {
        let (image, descriptor) = self.checked_image(entry, args);
        self.csa.push(&image, descriptor);
        self.live += 1;
    }

    /// Inserts a virgin image at the bottom; every stored peer runs first.
    fn spawn_behind(&mut self, entry: *const (), args: &[Word]) {
        let (image, descriptor) = self.checked_image(entry, args);
        self.csa.insert_bottom(&image, descriptor);
        self.live += 1;
    }

    fn checked_image(&self, entry: *const (), args: &[Word]) -> (Vec<Word>, Descriptor) {
        if args.len() > MAX_ARGC {
            fatal("coroutine argument count exceeds 127");
        }
        let (image, descriptor) = image::virgin_image(entry, self.ring_base, args);
        if !self.csa.fits(image.len() + 1) {
            fatal("storage area overflow on spawn");
        }
        (image, descriptor)
    }
}

/// Runs a ring to completion. Returns once the last coroutine retires.
pub(crate) fn run(ring: &[Coro]) {
    if ring.is_empty() {
        return;
    }
    if tls::installed() {
        fatal("cobegin inside a running ring");
    }

    log::debug!("starting ring of {} coroutines", ring.len());
    tls::install(Kernel::new(ring));

    unsafe { context_switch::ring_start() };

    let kernel = tls::uninstall();
    debug_assert_eq!(kernel.live, 0);
    debug_assert_eq!(kernel.csa.used(), 0);
    log::debug!("ring finished");
}

/// The yield point. No-op unless at least one peer is suspended.
pub(crate) fn yield_now() {
    let suspended_peers = tls::try_with(|kernel| kernel.live > 1).unwrap_or(false);
    if suspended_peers {
        unsafe { context_switch::ring_yield() };
    }
}

/// Live coroutine count; zero when no ring is running.
pub(crate) fn live_count() -> usize {
    tls::try_with(|kernel| kernel.live).unwrap_or(0)
}

/// Spawns into the running ring, behind the caller. Does not yield.
pub(crate) fn invoke_raw(entry: *const (), args: &[Word]) {
    log::trace!("invoking coroutine with {} arguments", args.len());
    tls::try_with(|kernel| kernel.spawn_behind(entry, args))
        .expect("invoke outside a running ring");
}

/// Saves the host continuation, derives the ring base, and spawns the
/// pending coroutines. Runs inside `ring_start`, before the first switch.
unsafe extern "C" fn begin_ring(host_rsp: *mut Word) {
    tls::with(|kernel| {
        kernel.host_rsp = host_rsp;
        kernel.ring_base = host_rsp.add(1);
        debug_assert_eq!(kernel.ring_base as usize % 16, 0);

        let pending = mem::take(&mut kernel.pending);
        for coroutine in &pending {
            kernel.spawn(coroutine.entry, &coroutine.args);
        }
    });
}

/// Encodes the yielder's live frame and rotates it to the bottom of the
/// storage area. Runs inside `ring_yield`, before the switch.
unsafe extern "C" fn park_current(rbp: *mut Word) {
    tls::with(|kernel| {
        let (bottom, words) = image::live_frame(rbp, kernel.ring_base);
        if !kernel.csa.fits(words + 1) {
            fatal("storage area overflow on yield");
        }
        let frame = slice::from_raw_parts(bottom, words);
        kernel.csa.insert_bottom(frame, Descriptor::resumed(words));
    });
}

/// Size of the next image, read ahead of the pop so the switch can open a
/// large enough scratch gap.
unsafe extern "C" fn peek_next_words() -> usize {
    tls::with(|kernel| match kernel.csa.peek() {
        Some(descriptor) => descriptor.words(),
        None => fatal("restore from an empty storage area"),
    })
}

/// Pops the top image, copies it onto the thread stack just under the
/// ring base, and primes the resume record. Runs beyond the scratch gap;
/// nothing here may touch stack memory above the gap except the image
/// copy itself.
unsafe extern "C" fn materialize_next() -> *const Resume {
    tls::with(|kernel| {
        let ring_base = kernel.ring_base;
        let (descriptor, source) = match kernel.csa.pop() {
            Some(popped) => popped,
            None => fatal("restore from an empty storage area"),
        };

        let bottom = (ring_base as usize - (descriptor.words() + 2) * 8) as *mut Word;
        ptr::copy_nonoverlapping(source.as_ptr(), bottom, descriptor.words());
        image::prime(&mut kernel.resume, bottom, descriptor);

        &kernel.resume as *const Resume
    })
}

/// Retires the returning coroutine. Hands back the host continuation when
/// it was the last one, null to continue with the next image.
unsafe extern "C" fn retire_current() -> *const Resume {
    tls::with(|kernel| {
        kernel.live -= 1;
        if kernel.live == 0 {
            kernel.resume.rsp = kernel.host_rsp;
            kernel.resume.args = [0; 6];
            &kernel.resume as *const Resume
        } else {
            ptr::null()
        }
    })
}

/// Fatal configuration errors don't report through return values: one
/// diagnostic line, then abort.
#[cold]
fn fatal(message: &str) -> ! {
    eprintln!("ringlet: {message}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Aligned stand-in for a ring base; spawning never dereferences it.
    const FAKE_BASE: *mut Word = 0x7fff_dead_0000 as *mut Word;

    fn kernel() -> Box<Kernel> {
        let mut kernel = Kernel::new(&[]);
        kernel.ring_base = FAKE_BASE;
        kernel
    }

    #[test]
    fn spawn_accounts_for_descriptor_words() {
        let mut kernel = kernel();

        kernel.spawn(ptr::null(), &[]);
        kernel.spawn(ptr::null(), &[1, 2, 3]);

        assert_eq!(kernel.live, 2);
        let expected = image::virgin_words(0) + 1 + image::virgin_words(3) + 1;
        assert_eq!(kernel.csa.used(), expected);
    }

    #[test]
    fn spawn_behind_runs_after_stored_peers() {
        let mut kernel = kernel();

        kernel.spawn(0x1 as *const (), &[]);
        kernel.spawn_behind(0x2 as *const (), &[]);

        let entry_slot = context_switch::SAVED_REGS + 1;
        let (_, first) = kernel.csa.pop().unwrap();
        assert_eq!(first[entry_slot], 0x1);
        let (_, second) = kernel.csa.pop().unwrap();
        assert_eq!(second[entry_slot], 0x2);
    }

    #[test]
    fn storage_area_renders_ring_contents() {
        let mut kernel = kernel();
        kernel.spawn(ptr::null(), &[7]);

        let rendered = format!("{:?}", kernel.csa);
        assert!(rendered.contains("virgin, argc 1"), "got: {rendered}");
    }
}
