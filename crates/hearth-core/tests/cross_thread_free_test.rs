//! Cross-thread free delivery: blocks freed on a foreign thread travel
//! back to their owning heap and surface on the page free lists after the
//! owner's next collect.

use hearth_core::{free, thread_stats, Heap};

#[test]
fn remote_free_returns_through_page_channel() {
    let heap = Heap::new();
    let keep = heap.allocate(64).expect("alloc keep");
    let p = heap.allocate(64).expect("alloc p");

    std::thread::spawn(move || free(p)).join().expect("join");

    // delivered but not yet collected: the block still counts as allocated
    assert!(heap.check_owned(p));
    heap.collect(false);
    // now it sits on its page's free list
    assert!(!heap.check_owned(p));
    assert!(heap.contains_block(p));
    assert!(heap.check_owned(keep));

    free(keep);
    heap.delete();
}

#[test]
fn remote_free_to_full_page_uses_delayed_channel() {
    let heap = Heap::new();
    // the 32 KiB class packs two blocks per page; the second fills it
    let a = heap.allocate(32 * 1024).expect("alloc a");
    let b = heap.allocate(32 * 1024).expect("alloc b");

    std::thread::spawn(move || free(b)).join().expect("join");

    assert!(heap.check_owned(b));
    let delayed_before = thread_stats().delayed_blocks;
    heap.collect(false);
    assert_eq!(thread_stats().delayed_blocks, delayed_before + 1);
    assert!(!heap.check_owned(b));
    assert!(heap.check_owned(a));

    // draining un-fulled the page, so the next allocation reuses it
    let c = heap.allocate(32 * 1024).expect("alloc c");
    assert_eq!(heap.page_count(), 1);

    free(a);
    free(c);
    assert_eq!(heap.page_count(), 0);
    heap.delete();
}

#[test]
fn many_remote_frees_from_many_threads() {
    let heap = Heap::new();
    let blocks: Vec<usize> = (0..64).map(|_| heap.allocate(256).expect("alloc")).collect();

    let handles: Vec<_> = blocks
        .chunks(16)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            std::thread::spawn(move || {
                for p in chunk {
                    free(p);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("join");
    }

    heap.collect(false);
    for &p in &blocks {
        assert!(!heap.check_owned(p));
    }
    heap.collect(true);
    assert_eq!(heap.page_count(), 0);
    heap.delete();
}
