//! Stack-frame codec.
//!
//! Translates between a live call frame on the thread stack and a packed
//! image in the storage area. An image is laid out so that the restore
//! tail's pop sequence works unchanged for both kinds:
//!
//! ```text
//! virgin:   [0; SAVED_REGS] [ring base] [entry] [cleanup] [shadow] [args] [fillers]
//! resumed:  [saved regs]    [saved rbp] [resume address] [frame words ...]
//! ```
//!
//! A live coroutine always occupies `[ring_base - words - 2, ring_base - 2)`,
//! an absolute range derived from its own size, so a restored image lands
//! at exactly the addresses it was captured from and needs no relocation.

use std::ptr;

use super::arena::Descriptor;
use super::context_switch as abi;
use super::context_switch::Resume;
use crate::Word;

/// Fill for alignment padding in virgin images.
pub(super) const FILLER_WORD: Word = -1;

/// Padding appended to a virgin image so the simulated call leaves the
/// stack 16-byte aligned: two fillers for an empty argument list, one when
/// the count is odd, none otherwise.
pub(super) fn filler_words(argc: usize) -> usize {
    match argc {
        0 => 2,
        n if n % 2 == 1 => 1,
        _ => 0,
    }
}

pub(super) fn virgin_words(argc: usize) -> usize {
    abi::FIXED_WORDS + abi::SHADOW_WORDS + argc + filler_words(argc)
}

/// Builds the packed image for a coroutine that has never run.
pub(super) fn virgin_image(
    entry: *const (),
    ring_base: *mut Word,
    args: &[Word],
) -> (Vec<Word>, Descriptor) {
    let argc = args.len();
    let mut image = Vec::with_capacity(virgin_words(argc));

    image.resize(abi::SAVED_REGS, 0);
    image.push(ring_base as Word);
    image.push(entry as Word);
    image.push(abi::cleanup_entry());
    #[cfg(windows)]
    image.resize(image.len() + abi::SHADOW_WORDS, abi::SHADOW_FILL);
    image.extend_from_slice(args);
    image.resize(image.len() + filler_words(argc), FILLER_WORD);

    debug_assert_eq!(image.len(), virgin_words(argc));
    debug_assert_eq!(image.len() % 2, 0, "image must preserve 16-byte alignment");

    let descriptor = Descriptor::virgin(image.len(), argc as u8);
    (image, descriptor)
}

/// Extent of a yielder's live frame, given the yield primitive's frame
/// pointer: from just below its saved callee-saved registers up to, but
/// not including, the two words under the ring base.
pub(super) fn live_frame(rbp: *mut Word, ring_base: *mut Word) -> (*mut Word, usize) {
    let bottom = (rbp as usize - abi::SAVED_REGS * 8) as *mut Word;
    let words = (ring_base as usize - 16 - bottom as usize) / 8;
    (bottom, words)
}

/// Primes the resume record for an image materialized at `bottom`.
///
/// For a virgin image this performs the simulated call: the first
/// `IN_REGISTER_ARGS` argument words go to the register file, and any
/// excess moves down to where the ABI expects on-stack arguments. The
/// virgin state dies with the popped descriptor; the image's next
/// descriptor is written by the yield path with a zero flag byte.
///
/// # Safety
/// `bottom` must point at a fully materialized image of the descriptor's
/// size.
pub(super) unsafe fn prime(resume: &mut Resume, bottom: *mut Word, descriptor: Descriptor) {
    resume.rsp = bottom;
    resume.args = [0; 6];

    if descriptor.is_virgin() {
        let argc = descriptor.argc();
        let arg_base = bottom.add(abi::ARG_OFFSET);

        let in_regs = argc.min(abi::IN_REGISTER_ARGS);
        for slot in 0..in_regs {
            resume.args[slot] = arg_base.add(slot).read();
        }

        let excess = argc - in_regs;
        if excess > 0 {
            ptr::copy(arg_base.add(abi::IN_REGISTER_ARGS), arg_base, excess);
        }
    }
}
