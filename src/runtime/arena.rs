//! Coroutine storage area.
//!
//! One packed run of machine words holds every suspended coroutine image
//! end-to-end, each followed by a trailing descriptor word. The cursor
//! points one past the last descriptor; the image under it is the next to
//! run. The area is backed by an anonymous mapping with a guard page above
//! the high end, so a kernel bug that outruns the cursor check faults
//! instead of scribbling over neighbouring allocations.

use std::{fmt, io, ptr};

use crate::Word;

/// Capacity of the storage area in machine words (720 KB).
// TODO: make the capacity configurable per ring; it is fixed for now.
pub(super) const CSA_WORDS: usize = 90_000;

const SIZE_MASK: Word = 0x00ff_ffff_ffff_ffff;
const VIRGIN_BIT: u8 = 0x80;

/// Trailing control word of a stored image: 56-bit word count plus an
/// 8-bit flag byte. A zero flag byte means "resume by returning"; the top
/// bit set means a virgin image whose low 7 flag bits hold the argument
/// count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Descriptor(Word);

impl Descriptor {
    pub(super) fn resumed(words: usize) -> Self {
        debug_assert!(words as Word & !SIZE_MASK == 0);
        Descriptor(words as Word)
    }

    pub(super) fn virgin(words: usize, argc: u8) -> Self {
        debug_assert!(argc < VIRGIN_BIT);
        debug_assert!(words as Word & !SIZE_MASK == 0);
        Descriptor((((VIRGIN_BIT | argc) as Word) << 56) | words as Word)
    }

    pub(super) fn words(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    /// Top bit of the flag byte is the sign bit of the whole word.
    pub(super) fn is_virgin(self) -> bool {
        self.0 < 0
    }

    pub(super) fn argc(self) -> usize {
        ((self.0 >> 56) as u8 & !VIRGIN_BIT) as usize
    }
}

/// The packed arena. Not thread-safe; owned by exactly one OS thread for
/// the lifetime of a ring.
pub(super) struct Arena {
    base: *mut Word,
    mapped: usize,
    capacity: usize,
    cursor: usize,
}

impl Arena {
    /// Maps `capacity` words of anonymous memory plus one `PROT_NONE`
    /// guard page above the high end.
    pub(super) fn new(capacity: usize) -> io::Result<Arena> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let usable = (capacity * 8).next_multiple_of(page_size);
        let mapped = usable + page_size;

        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let arena = Arena {
            base: pointer as *mut Word,
            mapped,
            capacity,
            cursor: 0,
        };

        let guard = unsafe { (pointer as *mut u8).add(usable) };
        let result = unsafe { libc::mprotect(guard as *mut _, page_size, libc::PROT_NONE) };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(arena)
    }

    /// Words currently stored, descriptors included.
    pub(super) fn used(&self) -> usize {
        self.cursor
    }

    pub(super) fn fits(&self, words: usize) -> bool {
        self.capacity - self.cursor >= words
    }

    /// Appends an image at the top; it becomes the next to run.
    pub(super) fn push(&mut self, image: &[Word], descriptor: Descriptor) {
        debug_assert!(self.fits(image.len() + 1));
        unsafe {
            ptr::copy_nonoverlapping(image.as_ptr(), self.base.add(self.cursor), image.len());
            self.base.add(self.cursor + image.len()).write(descriptor.0);
        }
        self.cursor += image.len() + 1;
    }

    /// Slides every stored image up and inserts `image` under all of them;
    /// it becomes the last to run. Used for the yield rotation and for
    /// placing an invoked coroutine behind the yielder.
    pub(super) fn insert_bottom(&mut self, image: &[Word], descriptor: Descriptor) {
        let incoming = image.len() + 1;
        debug_assert!(self.fits(incoming));
        unsafe {
            ptr::copy(self.base, self.base.add(incoming), self.cursor);
            ptr::copy_nonoverlapping(image.as_ptr(), self.base, image.len());
            self.base.add(image.len()).write(descriptor.0);
        }
        self.cursor += incoming;
    }

    pub(super) fn peek(&self) -> Option<Descriptor> {
        if self.cursor == 0 {
            return None;
        }
        Some(Descriptor(unsafe { self.base.add(self.cursor - 1).read() }))
    }

    /// Removes the top image. The returned slice stays valid until the
    /// next push.
    pub(super) fn pop(&mut self) -> Option<(Descriptor, &[Word])> {
        let descriptor = self.peek()?;
        self.cursor -= descriptor.words() + 1;
        let image = unsafe { std::slice::from_raw_parts(self.base.add(self.cursor), descriptor.words()) };
        Some((descriptor, image))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.base as *mut _, self.mapped) };
        assert_eq!(result, 0);
    }
}

/// Renders the stored ring top-down, one `{words, virgin, argc}` entry per
/// suspended coroutine.
impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena {{ used: {}/{}, ring: ", self.cursor, self.capacity)?;
        let mut list = f.debug_list();
        let mut position = self.cursor;
        while position > 0 {
            let descriptor = Descriptor(unsafe { self.base.add(position - 1).read() });
            if descriptor.is_virgin() {
                list.entry(&format_args!(
                    "{} words, virgin, argc {}",
                    descriptor.words(),
                    descriptor.argc()
                ));
            } else {
                list.entry(&format_args!("{} words", descriptor.words()));
            }
            position -= descriptor.words() + 1;
        }
        list.finish()?;
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn image(len: usize, fill: Word) -> Vec<Word> {
        vec![fill; len]
    }

    mod descriptor {
        use super::*;

        #[test]
        fn resumed_has_zero_flag() {
            let d = Descriptor::resumed(42);
            assert_eq!(d.words(), 42);
            assert!(!d.is_virgin());
        }

        #[test]
        fn virgin_carries_argc() {
            let d = Descriptor::virgin(10, 3);
            assert_eq!(d.words(), 10);
            assert!(d.is_virgin());
            assert_eq!(d.argc(), 3);
        }

        #[test]
        fn virgin_with_zero_args_is_still_marked() {
            assert!(Descriptor::virgin(6, 0).is_virgin());
        }

        proptest! {
            #[test]
            fn round_trips(words in 0usize..CSA_WORDS, argc in 0u8..0x80) {
                let d = Descriptor::virgin(words, argc);
                prop_assert_eq!(d.words(), words);
                prop_assert_eq!(d.argc(), argc as usize);
                prop_assert!(d.is_virgin());

                let d = Descriptor::resumed(words);
                prop_assert_eq!(d.words(), words);
                prop_assert!(!d.is_virgin());
            }
        }
    }

    mod storage {
        use super::*;

        #[test]
        fn push_then_pop() {
            let mut arena = Arena::new(64).unwrap();
            arena.push(&image(3, 7), Descriptor::resumed(3));
            assert_eq!(arena.used(), 4);

            let (descriptor, words) = arena.pop().unwrap();
            assert_eq!(descriptor.words(), 3);
            assert_eq!(words, &[7, 7, 7]);
            assert_eq!(arena.used(), 0);
        }

        #[test]
        fn pop_is_lifo() {
            let mut arena = Arena::new(64).unwrap();
            arena.push(&image(2, 1), Descriptor::resumed(2));
            arena.push(&image(2, 2), Descriptor::resumed(2));

            assert_eq!(arena.pop().unwrap().1, &[2, 2]);
            assert_eq!(arena.pop().unwrap().1, &[1, 1]);
        }

        #[test]
        fn insert_bottom_runs_last() {
            let mut arena = Arena::new(64).unwrap();
            arena.push(&image(2, 1), Descriptor::resumed(2));
            arena.insert_bottom(&image(4, 9), Descriptor::resumed(4));

            assert_eq!(arena.pop().unwrap().1, &[1, 1]);
            assert_eq!(arena.pop().unwrap().1, &[9, 9, 9, 9]);
            assert!(arena.pop().is_none());
        }

        #[test]
        fn peek_does_not_consume() {
            let mut arena = Arena::new(64).unwrap();
            arena.push(&image(1, 5), Descriptor::virgin(1, 1));
            assert!(arena.peek().unwrap().is_virgin());
            assert_eq!(arena.used(), 2);
        }

        #[test]
        fn fits_accounts_for_descriptor() {
            let mut arena = Arena::new(8).unwrap();
            arena.push(&image(5, 0), Descriptor::resumed(5));
            assert!(arena.fits(2));
            assert!(!arena.fits(3));
        }

        proptest! {
            /// The sum of all stored image sizes, each plus one descriptor
            /// word, always equals the cursor.
            #[test]
            fn cursor_accounting(ops in prop::collection::vec((0usize..3, 1usize..9), 0..40)) {
                let mut arena = Arena::new(1024).unwrap();
                let mut sizes: Vec<usize> = Vec::new();

                for (op, len) in ops {
                    match op {
                        0 => {
                            arena.push(&image(len, 0), Descriptor::resumed(len));
                            sizes.push(len);
                        }
                        1 => {
                            arena.insert_bottom(&image(len, 0), Descriptor::resumed(len));
                            sizes.insert(0, len);
                        }
                        _ => {
                            let popped = arena.pop();
                            prop_assert_eq!(popped.map(|(d, _)| d.words()), sizes.pop());
                        }
                    }
                    let expected: usize = sizes.iter().map(|s| s + 1).sum();
                    prop_assert_eq!(arena.used(), expected);
                }
            }
        }
    }
}
