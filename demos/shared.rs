//! Shares one heap between threads through [`SharedHeap`].

use heapalloc::SharedHeap;
use std::thread;

static HEAP: SharedHeap = SharedHeap::new();

fn main() {
    if let Err(err) = HEAP.init(1 << 16) {
        eprintln!("Error: {err}");
        return;
    }

    // Merge example
    let a = HEAP.alloc(60).expect("heap too small");
    let b = HEAP.alloc(60).expect("heap too small");

    HEAP.free(a.as_ptr()).unwrap();
    HEAP.free(b.as_ptr()).unwrap();

    // The cursor was on `b`, which got absorbed by the merge, so the next
    // search starts over at the first block.
    let c = HEAP.alloc(124).expect("heap too small");

    if a == c {
        println!("Correctly reused at {:p}", c);
    } else {
        println!("Not reused. A was at {:p} and C is at {:p}", a, c);
    }
    HEAP.free(c.as_ptr()).unwrap();

    // Thread example
    let workers: Vec<_> = (0..4)
        .map(|id| {
            thread::spawn(move || {
                for size in 1..=32 {
                    let addr = HEAP.alloc(size * (id + 1)).expect("heap too small");
                    HEAP.free(addr.as_ptr()).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    println!("{}", HEAP.inspect());
}
