//! The free-memory manager: power-of-two size-class buckets over slabs.
//!
//! The manager owns a table of free-slab lists, one per size class, and an
//! occupancy bitmask over the table. Allocation is O(1): the request size
//! maps to a bucket by ceiling-log2, and either the bucket's head slab has
//! a free slot (fast path) or an empty slab is popped from the smallest
//! sufficient class, carved down to size, and the remainder re-bucketed
//! (slow path). Deallocation recovers the owning slab by masking the
//! pointer down to slab alignment, clears the slot, and coalesces with
//! empty physical neighbours the moment a slab empties out.
//!
//! The manager never touches the backing bytes outside the slab headers,
//! and never frees them; the upstream supplier that produced the segments
//! owns them for the manager's whole lifetime.

use core::cmp;
use core::fmt;
use core::ptr::NonNull;

use log::debug;
use static_assertions::const_assert;

use crate::slab::{Slab, HEADER_SIZE};

/// One bucket per possible bit position of a size.
pub(crate) const MAX_BUCKETS: usize = usize::BITS as usize;
const_assert!(MAX_BUCKETS <= u64::BITS as usize);

/// Number of bits needed to represent `value` (`bit_width`).
fn bit_width(value: usize) -> usize {
    (usize::BITS - value.leading_zeros()) as usize
}

/// A single-threaded manager for a pool of free slabs.
///
/// Segments enter through
/// [`add_new_memory_segment`](FreeMemoryManager::add_new_memory_segment)
/// and are never given back; the manager borrows them from whoever
/// allocated the backing bytes. All
/// neighbour and free-list links are manipulated here and nowhere else.
///
/// `S` is the slab size: a power of two, fixed at compile time.
pub struct FreeMemoryManager<const S: usize> {
    /// Head of the doubly-linked free list for each size class. Bucket `b`
    /// holds slabs whose element size `e` satisfies `2^b <= e < 2^(b+1)`.
    free_segments: [Option<Slab<S>>; MAX_BUCKETS],
    /// Bit `b` set iff `free_segments[b]` is non-null.
    free_segments_mask: u64,
}

impl<const S: usize> Default for FreeMemoryManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const S: usize> FreeMemoryManager<S> {
    pub const fn new() -> Self {
        FreeMemoryManager {
            free_segments: [None; MAX_BUCKETS],
            free_segments_mask: 0,
        }
    }

    //============================================================
    // Size-class mapping

    /// The smallest bucket whose slabs can hold `size` bytes
    /// (ceiling-log2). A 5-byte request probes bucket 3 (size class 8).
    pub(crate) fn required_size_to_sufficient_bucket_index(size: usize) -> usize {
        debug_assert!(size > 0);
        bit_width(size - 1)
    }

    /// The bucket a slab of element size `size` lives in (floor-log2).
    /// An 8-byte class lives in bucket 3; a 2304-byte slab in bucket 11.
    pub(crate) fn block_size_to_bucket_index(size: usize) -> usize {
        debug_assert!(size > 0);
        bit_width(size) - 1
    }

    /// Sufficient bucket for a request, clamped up so the chosen element
    /// size never partitions a data block into more slots than the
    /// occupancy mask has bits.
    fn sufficient_bucket_index(size: usize) -> usize {
        cmp::max(
            Self::required_size_to_sufficient_bucket_index(size),
            Self::block_size_to_bucket_index(Slab::<S>::MIN_ELEMENT_SIZE),
        )
    }

    /// The element size a satisfying slab will be partitioned into: the
    /// matching power of two when that fits in one data block, otherwise
    /// whole slab units rounded up around the request plus header.
    fn required_size_to_element_size(size: usize) -> usize {
        let class = 1usize << Self::sufficient_bucket_index(size);
        if class <= Slab::<S>::DATA_CAPACITY {
            class
        } else {
            (size + HEADER_SIZE).div_ceil(S) * S - HEADER_SIZE
        }
    }

    //============================================================
    // Public contract

    /// Admit a freshly laundered segment: one empty slab with no
    /// neighbours and no free-list membership.
    ///
    /// # Safety
    ///
    /// The slab's backing region must stay alive and untouched by anything
    /// but this manager for as long as the manager is in use.
    pub unsafe fn add_new_memory_segment(&mut self, slab: Slab<S>) {
        assert!(slab.is_empty(), "a new segment must be empty");
        assert!(
            slab.neighbor_previous().is_none() && slab.neighbor_next().is_none(),
            "a new segment has no neighbours"
        );
        assert!(
            slab.free_links_null(),
            "a new segment must not be in a free list"
        );
        self.add_memory_segment(slab);
    }

    /// Hand out `size` usable bytes, or `None` when no slab can satisfy
    /// the request. The returned pointer is aligned to the chosen element
    /// size, up to the header size.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "zero-sized allocation");
        let matching_bucket = Self::sufficient_bucket_index(size);
        assert!(
            matching_bucket < MAX_BUCKETS,
            "allocation size exceeds the bucket table"
        );

        // Fast path: the matching class already has a slab with a free
        // slot. Its element size is at least 2^matching_bucket, so any
        // member fits the request.
        if self.free_segments_mask & (1u64 << matching_bucket) != 0 {
            let slab = self.free_segments[matching_bucket].unwrap();
            let index = slab.first_free_element();
            slab.set_element(index);
            if slab.is_full() {
                self.remove_from_free_list(slab);
            }
            debug!("allocate({}) -> slot {} of {:?}", size, index, slab);
            return Some(slab.element_ptr(index));
        }

        // Slow path: pop the smallest empty slab that is certainly large
        // enough and carve it. Buckets at or above the class of a whole
        // data block hold only unpartitioned slabs, so the scan never
        // lands on a partial one.
        let element_size = Self::required_size_to_element_size(size);
        let min_empty_bucket = cmp::max(
            Self::sufficient_bucket_index(element_size),
            Self::block_size_to_bucket_index(Slab::<S>::DATA_CAPACITY),
        );
        assert!(
            min_empty_bucket < MAX_BUCKETS,
            "allocation size exceeds the bucket table"
        );
        let candidates = self.free_segments_mask & (u64::MAX << min_empty_bucket);
        if candidates == 0 {
            debug!("allocate({}): out of memory", size);
            return None;
        }
        let bucket = candidates.trailing_zeros() as usize;
        let slab = self.free_segments[bucket].unwrap();
        self.remove_from_free_list(slab);
        debug_assert!(slab.is_empty());
        debug_assert!(slab.element_size() >= element_size);

        // Keep only as much of the slab as this element size needs; the
        // tail goes back into circulation as its own empty slab.
        let desired_total = cmp::max(element_size, Slab::<S>::DATA_CAPACITY) + HEADER_SIZE;
        self.split_slab_at_offset(slab, desired_total);

        slab.set_element_size(element_size);
        slab.set_element(0);
        if !slab.is_full() {
            self.add_to_bucket(slab);
        }
        debug!("allocate({}) -> slot 0 of carved {:?}", size, slab);
        Some(slab.element_ptr(0))
    }

    /// Release a block previously returned by
    /// [`allocate`](FreeMemoryManager::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this manager and must not
    /// have been released already. A pointer into the interior of an
    /// element releases that element.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let slab = Slab::<S>::containing(ptr);
        let offset = ptr.as_ptr() as usize - slab.base().as_ptr() as usize;
        assert!(
            offset >= HEADER_SIZE,
            "pointer does not point into a slab data block"
        );
        let element_index = (offset - HEADER_SIZE) / slab.element_size();
        assert!(
            slab.has_element(element_index),
            "releasing memory that was never acquired"
        );

        let was_full = slab.is_full();
        slab.clear_element(element_index);
        debug!("deallocate slot {} of {:?}", element_index, slab);

        if slab.is_empty() {
            // The slab leaves circulation as a partitioned slab and comes
            // back as an unpartitioned one, coalescing with any empty
            // neighbour.
            if !was_full {
                self.remove_from_free_list(slab);
            }
            if slab.element_size() < Slab::<S>::DATA_CAPACITY {
                slab.set_element_size(Slab::<S>::DATA_CAPACITY);
            }
            self.add_memory_segment(slab);
        } else if was_full {
            // Full slabs sit in no free list; a slot just opened up, so
            // the slab rejoins its bucket.
            self.add_to_bucket(slab);
        }
    }

    //============================================================
    // Split and merge

    /// Carve the tail of an empty, unlisted slab off at `offset` bytes
    /// from its base, leaving the head `offset` bytes total. The tail
    /// becomes a new empty slab, spliced into the neighbour chain and
    /// bucketed; the head is left for the caller to retype and re-insert.
    /// No-op when `offset` already equals the slab's total size.
    fn split_slab_at_offset(&mut self, slab: Slab<S>, offset: usize) {
        let total = slab.total_size();
        debug_assert!(offset % S == 0);
        assert!(offset <= total, "splitting past the end of a slab");
        if offset == total {
            return;
        }

        let tail_element_size = slab.element_size() - offset;
        let tail = unsafe {
            let tail_base = NonNull::new_unchecked(slab.base().as_ptr().add(offset));
            Slab::<S>::stamp(tail_base, tail_element_size)
        };

        tail.set_neighbor_previous(Some(slab));
        tail.set_neighbor_next(slab.neighbor_next());
        if let Some(next) = slab.neighbor_next() {
            next.set_neighbor_previous(Some(tail));
        }
        slab.set_neighbor_next(Some(tail));
        slab.set_element_size(offset - HEADER_SIZE);

        debug!("split {:?} off at offset {}", tail, offset);
        self.add_to_bucket(tail);
    }

    /// Fuse `slab` (empty, not in any list) with whichever physical
    /// neighbours are empty, and return the surviving slab. The previous
    /// neighbour absorbs `slab` if it can; the survivor then absorbs an
    /// empty next neighbour. Work is bounded by the two neighbours.
    fn merge_neighbors_into_slab(&mut self, slab: Slab<S>) -> Slab<S> {
        let mut survivor = slab;

        if let Some(previous) = survivor.neighbor_previous() {
            if previous.is_empty() {
                self.remove_from_free_list(previous);
                previous.set_element_size(previous.element_size() + survivor.total_size());
                let next = survivor.neighbor_next();
                previous.set_neighbor_next(next);
                if let Some(next) = next {
                    next.set_neighbor_previous(Some(previous));
                }
                survivor = previous;
            }
        }

        if let Some(next) = survivor.neighbor_next() {
            if next.is_empty() {
                self.remove_from_free_list(next);
                survivor.set_element_size(survivor.element_size() + next.total_size());
                let far = next.neighbor_next();
                survivor.set_neighbor_next(far);
                if let Some(far) = far {
                    far.set_neighbor_previous(Some(survivor));
                }
            }
        }

        survivor
    }

    /// Merge an empty, unlisted slab with its neighbours and bucket the
    /// survivor.
    fn add_memory_segment(&mut self, slab: Slab<S>) {
        let survivor = self.merge_neighbors_into_slab(slab);
        self.add_to_bucket(survivor);
    }

    //============================================================
    // Bucket maintenance

    /// Insert at the head of the bucket for the slab's element size.
    fn add_to_bucket(&mut self, slab: Slab<S>) {
        debug_assert!(slab.free_links_null());
        let bucket = Self::block_size_to_bucket_index(slab.element_size());
        let head = self.free_segments[bucket];
        slab.set_free_next(head);
        if let Some(head) = head {
            head.set_free_previous(Some(slab));
        }
        self.free_segments[bucket] = Some(slab);
        self.free_segments_mask |= 1u64 << bucket;
    }

    /// Standard doubly-linked removal; clears the bucket's mask bit when
    /// the list empties, and nulls the slab's free links.
    fn remove_from_free_list(&mut self, slab: Slab<S>) {
        let bucket = Self::block_size_to_bucket_index(slab.element_size());
        let previous = slab.free_previous();
        let next = slab.free_next();
        match previous {
            Some(previous) => previous.set_free_next(next),
            None => {
                debug_assert_eq!(self.free_segments[bucket], Some(slab));
                self.free_segments[bucket] = next;
                if next.is_none() {
                    self.free_segments_mask &= !(1u64 << bucket);
                }
            }
        }
        if let Some(next) = next {
            next.set_free_previous(previous);
        }
        slab.set_free_previous(None);
        slab.set_free_next(None);
    }

    //============================================================
    // Introspection

    /// Walk the whole bucket table, tallying invariant violations and
    /// free-space statistics.
    pub fn check(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        for bucket in 0..MAX_BUCKETS {
            let head = self.free_segments[bucket];
            if head.is_some() != (self.free_segments_mask & (1u64 << bucket) != 0) {
                validity.mask_disagreements += 1;
            }

            let mut previous: Option<Slab<S>> = None;
            let mut cursor = head;
            while let Some(slab) = cursor {
                if Self::block_size_to_bucket_index(slab.element_size()) != bucket {
                    validity.misfiled += 1;
                }
                if slab.is_full() {
                    validity.full_listed += 1;
                }
                if slab.free_previous() != previous {
                    validity.broken_links += 1;
                }
                let max_elements = slab.max_elements();
                if max_elements < usize::BITS as usize && slab.mask() >> max_elements != 0 {
                    validity.stray_bits += 1;
                }

                stats.free_slabs += 1;
                stats.free_bytes +=
                    (max_elements - slab.mask().count_ones() as usize) * slab.element_size();

                previous = cursor;
                cursor = slab.free_next();
            }
        }

        (validity, stats)
    }
}

impl<const S: usize> fmt::Debug for FreeMemoryManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FreeMemoryManager(mask: {:#x}",
            self.free_segments_mask
        )?;
        for bucket in 0..MAX_BUCKETS {
            let mut cursor = self.free_segments[bucket];
            if cursor.is_none() {
                continue;
            }
            write!(f, ", [{}]:", bucket)?;
            while let Some(slab) = cursor {
                write!(f, " {:?}", slab)?;
                cursor = slab.free_next();
            }
        }
        write!(f, ")")
    }
}

/// Tally of free-structure invariant violations found by
/// [`FreeMemoryManager::check`].
#[derive(Default, Debug)]
pub struct Validity {
    /// Buckets whose head pointer disagrees with the occupancy mask bit.
    pub mask_disagreements: usize,
    /// Slabs threaded in a bucket their element size does not map to.
    pub misfiled: usize,
    /// Fully-allocated slabs found in a free list. Full slabs must be
    /// unlinked.
    pub full_listed: usize,
    /// Free-list back-pointers that do not match the forward walk.
    pub broken_links: usize,
    /// Occupancy bits set above a slab's element capacity.
    pub stray_bits: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.mask_disagreements == 0
            && self.misfiled == 0
            && self.full_listed == 0
            && self.broken_links == 0
            && self.stray_bits == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

/// Free-space counters gathered alongside [`Validity`].
#[derive(Default, Debug)]
pub struct Stats {
    /// Slabs threaded through the bucket table.
    pub free_slabs: usize,
    /// Unallocated element bytes across those slabs.
    pub free_bytes: usize,
}
