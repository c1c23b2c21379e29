//! Two coroutines handing control back and forth.

use ringlet::{cobegin, coresume, coroutine_count, Coro};

extern "C" fn ping() {
    for lap in 0..3 {
        println!("ping {lap} ({} live)", coroutine_count());
        coresume();
    }
}

extern "C" fn pong() {
    for lap in 0..3 {
        println!("pong {lap}");
        coresume();
    }
}

fn main() {
    unsafe {
        cobegin(&[
            Coro::new(ping as extern "C" fn(), []),
            Coro::new(pong as extern "C" fn(), []),
        ]);
    }
    println!("ring finished");
}
