//! Uses the provided allocator as the global allocator, churns through a
//! large number of randomly-sized objects, and checks the free
//! structures for validity along the way.

use slaballoc::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};

// This is the magic line that makes every Box and Vec below go through
// the slab allocator.
#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Total number of allocate/free steps
const STEPS: usize = 64 * 1024;
// Log_2 of the largest object to allocate
const LOG2_MAX_SIZE: u32 = 20;
// How often to print a progress line
const REPORT_EVERY: usize = 4096;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [STEPS] [LOG2_MAX_SIZE]", args[0]);
        return;
    }
    let steps: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let log2_max_size: u32 = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    env_logger::init();
    println!("Running stress test: {} steps, objects up to 2^{} bytes", steps, log2_max_size);

    let seed: u64 = rand::thread_rng().next_u64();
    println!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let exponents = Uniform::new_inclusive(3, log2_max_size);

    let mut live: Vec<Vec<u8>> = Vec::new();
    let mut held_bytes: usize = 0;

    for step in 1..=steps {
        // Lean towards allocating while little is held, towards freeing
        // while a lot is.
        let allocate = live.is_empty() || (rng.next_u64() as usize) % (live.len() + 64) < 64;
        if allocate {
            // Sizes spread over the exponent range, so small objects
            // dominate but multi-slab ones show up regularly.
            let size = 1usize << exponents.sample(&mut rng);
            live.push(vec![0xa5u8; size]);
            held_bytes += size;
        } else {
            let index = (rng.next_u64() as usize) % live.len();
            let gone = live.swap_remove(index);
            held_bytes -= gone.len();
        }

        let (validity, stats) = ALLOCATOR.stats();
        assert!(validity.is_valid(), "step {}: {:?}", step, validity);
        if step % REPORT_EVERY == 0 {
            println!(
                "step {:>8}: {} objects / {} bytes held, {} free slabs / {} free bytes",
                step,
                live.len(),
                held_bytes,
                stats.free_slabs,
                stats.free_bytes
            );
        }
    }

    println!("Draining {} remaining objects", live.len());
    while let Some(gone) = live.pop() {
        held_bytes -= gone.len();
        let (validity, _) = ALLOCATOR.stats();
        assert!(validity.is_valid());
    }
    assert_eq!(held_bytes, 0);

    let (validity, stats) = ALLOCATOR.stats();
    println!("\nFinished.");
    println!("    Stats: {:?}", stats);
    assert!(validity.is_valid());
}
