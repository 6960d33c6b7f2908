//! Safe delete versus concurrent remote frees: blocks queued on a heap's
//! delayed channel survive the heap being deleted, with no loss and no
//! double count.

use hearth_core::{backing_heap, free, thread_stats, Heap};

#[test]
fn delete_preserves_queued_delayed_frees() {
    let backing = backing_heap();
    let child = Heap::new();
    // two full pages of the 32 KiB class (two blocks per page)
    let blocks: Vec<usize> = (0..4)
        .map(|_| child.allocate(32 * 1024).expect("alloc"))
        .collect();
    assert_eq!(child.page_count(), 2);

    // a remote thread frees three of the four; full pages route onto the
    // child's delayed channel
    let to_free = blocks[..3].to_vec();
    std::thread::spawn(move || {
        for p in to_free {
            free(p);
        }
    })
    .join()
    .expect("join");

    let before = backing.page_count();
    child.delete();
    assert_eq!(child.page_count(), 0);
    assert_eq!(backing.page_count(), before + 2);
    // queued but not yet drained: the blocks still count as allocated
    for &p in &blocks[..3] {
        assert!(backing.check_owned(p));
    }

    let delayed_before = thread_stats().delayed_blocks;
    backing.collect(false);
    assert_eq!(thread_stats().delayed_blocks, delayed_before + 3);
    for &p in &blocks[..3] {
        assert!(!backing.check_owned(p));
    }
    assert!(backing.check_owned(blocks[3]));

    free(blocks[3]);
    backing.collect(true);
    assert_eq!(backing.page_count(), 0);
}

#[test]
fn racing_remote_frees_are_never_lost() {
    for _ in 0..32 {
        let child = Heap::new();
        let blocks: Vec<usize> = (0..4)
            .map(|_| child.allocate(32 * 1024).expect("alloc"))
            .collect();
        let to_free = blocks.clone();
        let remote = std::thread::spawn(move || {
            for p in to_free {
                free(p);
            }
        });
        child.delete();
        remote.join().expect("join");

        let backing = backing_heap();
        backing.collect(false);
        // every block went back to a free list, wherever the race landed it
        for &p in &blocks {
            assert!(!backing.check_owned(p));
        }
        backing.collect(true);
        assert_eq!(backing.page_count(), 0);
    }
}
