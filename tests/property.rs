//! Generated ring scenarios over the public surface.

use std::cell::RefCell;

use proptest::prelude::*;
use ringlet::{cobegin, Coro, Word};

thread_local! {
    static SINK: RefCell<Vec<Word>> = const { RefCell::new(Vec::new()) };
}

fn sink(word: Word) {
    SINK.with(|sink| sink.borrow_mut().push(word));
}

fn drain() -> Vec<Word> {
    SINK.with(|sink| sink.borrow_mut().split_off(0))
}

extern "C" fn echo1(a: Word) {
    sink(a);
}

extern "C" fn echo2(a: Word, b: Word) {
    sink(a);
    sink(b);
}

extern "C" fn echo8(a: Word, b: Word, c: Word, d: Word, e: Word, f: Word, g: Word, h: Word) {
    for word in [a, b, c, d, e, f, g, h] {
        sink(word);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Arbitrary words survive the virgin dispatch, both the slots that
    /// travel in registers and the ones relocated onto the stack.
    #[test]
    fn arguments_round_trip(words in prop::array::uniform8(any::<Word>())) {
        unsafe {
            cobegin(&[Coro::new(
                echo8 as extern "C" fn(Word, Word, Word, Word, Word, Word, Word, Word),
                words,
            )]);
        }
        prop_assert_eq!(drain(), words.to_vec());
    }

    /// Every spawned coroutine runs exactly once, in reverse spawn order.
    #[test]
    fn whole_ring_runs_once(ids in prop::collection::vec(any::<Word>(), 1..24)) {
        let ring: Vec<Coro> = ids
            .iter()
            .map(|&id| Coro::new(echo1 as extern "C" fn(Word), [id]))
            .collect();

        unsafe { cobegin(&ring) };

        let mut expected = ids;
        expected.reverse();
        prop_assert_eq!(drain(), expected);
    }

    /// Mixed arities in one ring each observe their own argument list.
    #[test]
    fn mixed_arities_stay_separate(a in any::<Word>(), b in any::<Word>(), c in any::<Word>()) {
        unsafe {
            cobegin(&[
                Coro::new(echo1 as extern "C" fn(Word), [a]),
                Coro::new(echo2 as extern "C" fn(Word, Word), [b, c]),
            ]);
        }
        prop_assert_eq!(drain(), vec![b, c, a]);
    }
}
