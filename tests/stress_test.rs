use core::ptr::NonNull;

use slaballoc::allocators::{SlabAlloc, ToyHeap};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

const SLAB: usize = 256;

#[test]
fn test_stress() {
    let toy_heap = ToyHeap::default();
    let mut allocator: SlabAlloc<ToyHeap, SLAB> = SlabAlloc::new(toy_heap);

    // Live pointers; None means the slot is not allocated.
    let mut pointers: [Option<NonNull<u8>>; 128] = [None; 128];
    let mut allocated_count: usize = 0;
    let mut freed_count: usize = 0;
    let mut failed_count: usize = 0;

    fn validate(allocator: &SlabAlloc<ToyHeap, SLAB>, allocated: usize, freed: usize) {
        let (validity, stats) = allocator.stats();
        log::info!(
            "Allocated: {}, Freed: {}; heap size: {}; Validity: {:?}, Stats: {:?}",
            allocated,
            freed,
            allocator.grower.size,
            validity,
            stats,
        );
        assert!(validity.is_valid());
    }

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 4 * SLAB);

    for _ in 0..1024 * 10 {
        let slot = (rng.next_u64() as usize) % pointers.len();
        match pointers[slot] {
            None => {
                // Let's try allocating
                let new_size = range.sample(&mut rng);
                log::info!("Allocating {}", new_size);
                match unsafe { allocator.allocate(new_size) } {
                    Some(ptr) => {
                        log::info!("  Allocated {:?} of {}", ptr, new_size);
                        // Scribble over the block; the allocator must not
                        // care what we do with the data area.
                        unsafe { ptr.as_ptr().write_bytes(0x5a, new_size) };
                        pointers[slot] = Some(ptr);
                        allocated_count += 1;
                    }
                    None => {
                        // The toy heap is finite; running dry is expected.
                        log::info!("  Out of memory at {}", new_size);
                        failed_count += 1;
                    }
                }
            }
            Some(ptr) => {
                // Let's try freeing
                log::info!("Deallocating {:?}", ptr);
                unsafe { allocator.deallocate(ptr) };
                pointers[slot] = None;
                freed_count += 1;
            }
        }

        // And validate that everything is ok
        validate(&allocator, allocated_count, freed_count);
    }

    log::info!(
        "Churned: {} allocated, {} freed, {} failed",
        allocated_count,
        freed_count,
        failed_count
    );

    // Drain everything in a random order; every upstream growth must
    // coalesce back into a single empty slab.
    let mut order: Vec<usize> = (0..pointers.len()).collect();
    order.shuffle(&mut rng);
    for slot in order {
        if let Some(ptr) = pointers[slot].take() {
            unsafe { allocator.deallocate(ptr) };
            freed_count += 1;
            validate(&allocator, allocated_count, freed_count);
        }
    }

    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.free_slabs, allocator.grower.growths);
}
