//! Allocation churn through the manager directly: the workloads a
//! general-purpose allocator lives on, timed against the system
//! allocator for a rough comparison.

use std::ptr::NonNull;
use std::time::Instant;

use slaballoc::{FreeMemoryManager, Slab};

const SLAB: usize = 256;
const UNITS: usize = 4096;
const ITERATIONS: usize = 1000;
const ROUNDS: usize = 100;

// A slab-aligned arena to carve the manager's pool out of.
#[repr(C, align(256))]
struct Arena([u8; UNITS * SLAB]);

fn timed(name: &str, mut round: impl FnMut()) {
    let start = Instant::now();
    for _ in 0..ROUNDS {
        round();
    }
    println!("{:<40} {:>10.0?}", name, start.elapsed() / ROUNDS as u32);
}

fn main() {
    env_logger::init();

    let mut arena = Box::new(Arena([0; UNITS * SLAB]));
    let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
    let mut manager: FreeMemoryManager<SLAB> = FreeMemoryManager::new();
    unsafe { manager.add_new_memory_segment(Slab::launder(base, UNITS)) };

    let mut pointers: Vec<NonNull<u8>> = Vec::with_capacity(3 * ITERATIONS);

    timed("same-size small allocations (new)", || {
        let boxes: Vec<Box<u32>> = (0..ITERATIONS as u32).map(Box::new).collect();
        drop(boxes);
    });

    timed("same-size small allocations (manager)", || {
        for i in 0..ITERATIONS {
            let ptr = manager.allocate(4).unwrap();
            unsafe { ptr.as_ptr().cast::<u32>().write(i as u32) };
            pointers.push(ptr);
        }
        for ptr in pointers.drain(..) {
            unsafe { manager.deallocate(ptr) };
        }
    });

    timed("mixed-size small allocations (manager)", || {
        for i in 0..ITERATIONS {
            for size in [1usize, 4, 8] {
                let ptr = manager.allocate(size).unwrap();
                unsafe { ptr.as_ptr().write(i as u8) };
                pointers.push(ptr);
            }
        }
        for ptr in pointers.drain(..) {
            unsafe { manager.deallocate(ptr) };
        }
    });

    timed("big allocations (manager)", || {
        for _ in 0..ITERATIONS {
            let ptr = manager.allocate(1024).unwrap();
            unsafe { ptr.as_ptr().write_bytes(0, 1024) };
            pointers.push(ptr);
            // Keep a bounded working set; the pool is finite.
            if pointers.len() == 512 {
                for ptr in pointers.drain(..) {
                    unsafe { manager.deallocate(ptr) };
                }
            }
        }
        for ptr in pointers.drain(..) {
            unsafe { manager.deallocate(ptr) };
        }
    });

    let (validity, stats) = manager.check();
    assert!(validity.is_valid());
    println!("\nFinal state: {:?}", stats);
}
