//! In-band slab metadata and the operations on a single slab.
//!
//! A slab is a region of exactly `S` bytes, aligned to `S`, where `S` is a
//! compile-time power of two. The first [`HEADER_SIZE`] bytes hold the
//! header; the rest is the data block, carved into equally-sized elements.
//! An empty slab may also span several physical slab units, in which case
//! its `element_size` covers the whole multi-unit data region and the
//! header sits in the first unit.
//!
//! This module is the only place that touches the raw header fields. The
//! doubly-linked neighbour and free-list chains threaded through headers
//! are manipulated exclusively through [`Slab`] handles; everything above
//! this module (notably [`FreeMemoryManager`](crate::manager)) works in
//! terms of those handles.

use core::cmp;
use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use static_assertions::const_assert_eq;

/// A doubly-linked pair of header pointers.
#[repr(C)]
struct Links {
    previous: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
}

/// The header stamped at the base of every slab.
///
/// `neighbors` orders slabs by physical address within one upstream
/// segment. `free_list` threads an empty slab through its size-class
/// bucket; both pointers are null while the slab is allocated out.
/// `mask` has bit `i` set iff element slot `i` is in use.
///
/// The header is padded to 64 bytes so the data block starts at a fixed
/// offset with `max_align_t`-or-better alignment.
#[repr(C, align(64))]
pub(crate) struct SlabHeader {
    neighbors: Links,
    free_list: Links,
    element_size: usize,
    mask: usize,
}

/// Bytes from a slab's base to its data block.
pub const HEADER_SIZE: usize = size_of::<SlabHeader>();
const_assert_eq!(HEADER_SIZE, 64);

/// A handle to a slab header living inside managed memory.
///
/// This is a thin copyable wrapper around the header pointer, much like a
/// reference, except that it makes no aliasing claims: many handles to the
/// same slab coexist (the bucket table, both neighbours, the free list).
/// All reads and writes go through the raw pointer.
///
/// Handles are only created by the unsafe constructors [`Slab::launder`]
/// and [`Slab::containing`]; from then on the methods are safe to call as
/// long as the backing memory stays alive, which the manager's borrow of
/// its segments guarantees.
pub struct Slab<const S: usize> {
    header: NonNull<SlabHeader>,
}

impl<const S: usize> Copy for Slab<S> {}

impl<const S: usize> Clone for Slab<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const S: usize> PartialEq for Slab<S> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<const S: usize> Eq for Slab<S> {}

// Handles can move between threads together with the manager that owns
// them; nothing here is tied to a particular thread.
unsafe impl<const S: usize> Send for Slab<S> {}

impl<const S: usize> Slab<S> {
    // Referenced from the constructors so that an invalid slab size fails
    // at compile time rather than producing nonsense geometry.
    const SIZE_OK: () = assert!(
        S.is_power_of_two() && S > HEADER_SIZE,
        "slab size must be a power of two with room for a data block"
    );

    /// Capacity of a single slab unit's data block.
    pub const DATA_CAPACITY: usize = S - HEADER_SIZE;

    /// The smallest element size a slab may be partitioned into.
    ///
    /// The occupancy mask is one word, so a data block must never divide
    /// into more elements than the word has bits.
    pub const MIN_ELEMENT_SIZE: usize =
        ((Self::DATA_CAPACITY + usize::BITS as usize - 1) / usize::BITS as usize)
            .next_power_of_two();

    /// Stamp a fresh header onto `slab_count` contiguous slab units at
    /// `base`, producing a single empty slab covering all of them: no
    /// neighbours, no free-list membership, element size equal to the
    /// whole data region.
    ///
    /// # Safety
    ///
    /// `base` must point to `slab_count * S` bytes of writable memory not
    /// in use by anything else, and ownership of that region passes to
    /// whoever holds the returned handle (in practice, the manager the
    /// slab is submitted to).
    pub unsafe fn launder(base: NonNull<u8>, slab_count: usize) -> Slab<S> {
        let () = Self::SIZE_OK;
        assert!(slab_count >= 1, "a segment spans at least one slab unit");
        assert_eq!(
            base.as_ptr() as usize % S,
            0,
            "segment base must be slab-aligned"
        );
        Self::stamp(base, slab_count * S - HEADER_SIZE)
    }

    /// Stamp a header with the given element size at `base`.
    ///
    /// Used by [`launder`](Self::launder) and by the manager when a split
    /// creates a tail slab partway through a region.
    ///
    /// # Safety
    ///
    /// `base` must be `S`-aligned and point to at least
    /// `element_size + HEADER_SIZE` bytes of writable, otherwise-unused
    /// memory.
    pub(crate) unsafe fn stamp(base: NonNull<u8>, element_size: usize) -> Slab<S> {
        let header: NonNull<SlabHeader> = base.cast();
        header.as_ptr().write(SlabHeader {
            neighbors: Links {
                previous: None,
                next: None,
            },
            free_list: Links {
                previous: None,
                next: None,
            },
            element_size,
            mask: 0,
        });
        Slab { header }
    }

    /// Recover the slab owning `ptr` by masking the address down to slab
    /// alignment.
    ///
    /// # Safety
    ///
    /// `ptr` must point into the data block of a live slab of size `S`.
    pub unsafe fn containing(ptr: NonNull<u8>) -> Slab<S> {
        let () = Self::SIZE_OK;
        let base = ptr.as_ptr() as usize & !(S - 1);
        Slab {
            header: NonNull::new_unchecked(base as *mut SlabHeader),
        }
    }

    /// The slab's base address (also the header address).
    pub fn base(self) -> NonNull<u8> {
        self.header.cast()
    }

    fn raw(self) -> *mut SlabHeader {
        self.header.as_ptr()
    }

    //============================================================
    // Metadata

    pub fn element_size(self) -> usize {
        unsafe { (*self.raw()).element_size }
    }

    pub(crate) fn set_element_size(self, element_size: usize) {
        debug_assert!(element_size > 0);
        unsafe { (*self.raw()).element_size = element_size }
    }

    pub fn mask(self) -> usize {
        unsafe { (*self.raw()).mask }
    }

    /// Total bytes this slab spans, header included.
    ///
    /// Only meaningful while the slab is unpartitioned (empty slabs always
    /// cover whole slab units, so `element_size + HEADER_SIZE` is exact);
    /// a slab partitioned into small elements still spans one unit
    /// regardless of its element size.
    pub fn total_size(self) -> usize {
        self.element_size() + HEADER_SIZE
    }

    //============================================================
    // Occupancy

    /// How many element slots this slab currently has. Derived, never
    /// stored: retyping `element_size` instantly reinterprets capacity.
    pub fn max_elements(self) -> usize {
        cmp::max(1, Self::DATA_CAPACITY / self.element_size())
    }

    fn full_mask(self) -> usize {
        // max_elements can be a full word, so build the mask from the top.
        usize::MAX >> (usize::BITS as usize - self.max_elements())
    }

    pub fn is_empty(self) -> bool {
        self.mask() == 0
    }

    pub fn is_full(self) -> bool {
        self.mask() == self.full_mask()
    }

    pub fn has_element(self, index: usize) -> bool {
        index < usize::BITS as usize && self.mask() & (1 << index) != 0
    }

    /// Index of the first free slot: the count of trailing ones in the
    /// mask. Equals `max_elements()` when the slab is full.
    pub fn first_free_element(self) -> usize {
        self.mask().trailing_ones() as usize
    }

    pub(crate) fn set_element(self, index: usize) {
        assert!(index < self.max_elements());
        unsafe { (*self.raw()).mask |= 1 << index }
    }

    pub(crate) fn clear_element(self, index: usize) {
        assert!(index < self.max_elements());
        unsafe { (*self.raw()).mask &= !(1 << index) }
    }

    /// Address of element slot `index` within the data block.
    pub fn element_ptr(self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.max_elements());
        let offset = HEADER_SIZE + index * self.element_size();
        unsafe { NonNull::new_unchecked(self.base().as_ptr().add(offset)) }
    }

    //============================================================
    // Neighbour chain (physical adjacency within one segment)

    pub fn neighbor_previous(self) -> Option<Slab<S>> {
        Self::from_link(unsafe { (*self.raw()).neighbors.previous })
    }

    pub fn neighbor_next(self) -> Option<Slab<S>> {
        Self::from_link(unsafe { (*self.raw()).neighbors.next })
    }

    pub(crate) fn set_neighbor_previous(self, slab: Option<Slab<S>>) {
        unsafe { (*self.raw()).neighbors.previous = Self::to_link(slab) }
    }

    pub(crate) fn set_neighbor_next(self, slab: Option<Slab<S>>) {
        unsafe { (*self.raw()).neighbors.next = Self::to_link(slab) }
    }

    /// Both neighbour back-pointers agree with this slab's own links.
    pub fn neighbors_consistent(self) -> bool {
        let next_ok = match self.neighbor_next() {
            Some(next) => next.neighbor_previous() == Some(self),
            None => true,
        };
        let previous_ok = match self.neighbor_previous() {
            Some(previous) => previous.neighbor_next() == Some(self),
            None => true,
        };
        next_ok && previous_ok
    }

    //============================================================
    // Free-list chain (per-bucket threading; manager-internal)

    pub(crate) fn free_previous(self) -> Option<Slab<S>> {
        Self::from_link(unsafe { (*self.raw()).free_list.previous })
    }

    pub(crate) fn free_next(self) -> Option<Slab<S>> {
        Self::from_link(unsafe { (*self.raw()).free_list.next })
    }

    pub(crate) fn set_free_previous(self, slab: Option<Slab<S>>) {
        unsafe { (*self.raw()).free_list.previous = Self::to_link(slab) }
    }

    pub(crate) fn set_free_next(self, slab: Option<Slab<S>>) {
        unsafe { (*self.raw()).free_list.next = Self::to_link(slab) }
    }

    /// A freshly laundered or fully-allocated slab has both free-list
    /// links null.
    pub(crate) fn free_links_null(self) -> bool {
        self.free_previous().is_none() && self.free_next().is_none()
    }

    fn from_link(link: Option<NonNull<SlabHeader>>) -> Option<Slab<S>> {
        link.map(|header| Slab { header })
    }

    fn to_link(slab: Option<Slab<S>>) -> Option<NonNull<SlabHeader>> {
        slab.map(|s| s.header)
    }
}

impl<const S: usize> fmt::Debug for Slab<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("@addr", &self.header)
            .field("element_size", &self.element_size())
            .field("mask", &format_args!("{:#x}", self.mask()))
            .finish()
    }
}
