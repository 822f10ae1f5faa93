use std::ptr::{self, NonNull};

use heapalloc::{ALIGNMENT, Heap, Status};
use rand::{Rng, SeedableRng, rngs::StdRng};

struct Live {
    addr: NonNull<u8>,
    size: usize,
    tag: u8,
}

fn intact(live: &Live) -> bool {
    unsafe { std::slice::from_raw_parts(live.addr.as_ptr(), live.size) }
        .iter()
        .all(|byte| *byte == live.tag)
}

#[test]
fn random_alloc_free_keeps_heap_consistent() {
    let mut rng = StdRng::seed_from_u64(0x354);
    let mut heap = Heap::new();
    heap.init(1 << 15).unwrap();
    let capacity = heap.capacity().unwrap();

    let mut live: Vec<Live> = Vec::new();
    let mut failures = 0;

    for step in 0..5000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let size = rng.gen_range(1..=512);
            match heap.alloc(size) {
                Some(addr) => {
                    assert!((addr.as_ptr() as usize).is_multiple_of(ALIGNMENT));
                    let tag = (step % 251) as u8;
                    unsafe { ptr::write_bytes(addr.as_ptr(), tag, size as usize) };
                    live.push(Live {
                        addr,
                        size: size as usize,
                        tag,
                    });
                }
                None => failures += 1,
            }
        } else {
            let block = live.swap_remove(rng.gen_range(0..live.len()));
            // Overlapping allocations would have overwritten the pattern.
            assert!(intact(&block), "payload of {:?} was overwritten", block.addr);
            heap.free(block.addr.as_ptr()).unwrap();
            assert!(heap.free(block.addr.as_ptr()).is_err());
        }

        heap.verify().unwrap();

        let report = heap.inspect();
        assert_eq!(report.total(), capacity);
        for pair in report.blocks.windows(2) {
            assert!(pair[0].status == Status::Used || pair[1].status == Status::Used);
        }
    }

    // Some requests must have hit a full heap, otherwise the test is too easy.
    assert!(failures > 0);

    for block in live.drain(..) {
        assert!(intact(&block));
        heap.free(block.addr.as_ptr()).unwrap();
    }

    let report = heap.inspect();
    assert_eq!(report.blocks.len(), 1);
    assert_eq!(report.free, capacity);
    heap.verify().unwrap();
}
