use heapalloc::Heap;

fn log_alloc(size: i32, addr: Option<std::ptr::NonNull<u8>>) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut heap = Heap::new();

    if let Err(err) = heap.init(4096) {
        eprintln!("Error: {err}");
        return;
    }

    let a = heap.alloc(100);
    log_alloc(100, a);

    let b = heap.alloc(5000);
    log_alloc(5000, b);

    let c = heap.alloc(16);
    log_alloc(16, c);

    println!("{}", heap.inspect());

    for addr in [a, c].into_iter().flatten() {
        if let Err(err) = heap.free(addr.as_ptr()) {
            eprintln!("Error: {err}");
        }
    }

    // Freeing twice is reported, not fatal.
    if let Some(addr) = a {
        println!("Second free: {:?}", heap.free(addr.as_ptr()));
    }

    println!("{}", heap.inspect());
}
