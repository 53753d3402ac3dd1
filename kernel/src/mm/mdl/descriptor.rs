//! Descriptor record: the fundamental entity tracked by the memory
//! descriptor list.
//!
//! Each descriptor describes one contiguous, same-type address range and
//! doubles as a node in up to two intrusive structures at once: the
//! ordered index (a red-black tree keyed by `base_address`) and either a
//! free-size bucket or the arena's unused reserve, never both.

use bitflags::bitflags;

/// Sentinel used for "no node" in every intrusive link field.
pub const NIL: u32 = u32::MAX;

/// Memory kind tag. Closed set, matches the loader memory types this
/// kernel's UEFI bootloader reports plus the kernel's own bookkeeping
/// types (page tables, pool regions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionType {
    /// Usable, unallocated memory.
    Free,
    /// Reserved by firmware or platform, never allocatable.
    Reserved,
    /// Firmware scratch space, reclaimable after boot services exit.
    FirmwareTemporary,
    /// Firmware state that must persist for the life of the system.
    FirmwarePermanent,
    /// ACPI tables, reclaimable once parsed.
    AcpiTables,
    /// ACPI non-volatile storage, must be preserved.
    AcpiNvs,
    /// Known-bad memory, never allocatable.
    Bad,
    /// Loader scratch space, reclaimable after handoff.
    LoaderTemporary,
    /// Loader state the kernel keeps using (e.g. the loaded image).
    LoaderPermanent,
    /// Page table pages in active use.
    PageTables,
    /// Page tables built by the loader before the kernel takes over.
    BootPageTables,
    /// Memory manager bootstrap structures (the MDL's own arena, etc).
    MmInit,
    /// Backing store for the non-paged pool.
    NonPagedPool,
    /// Backing store for the paged pool.
    PagedPool,
    /// Memory-mapped hardware, not real RAM.
    Hardware,
}

impl RegionType {
    /// Only `Free` regions participate in the free-size index.
    pub const fn is_free_like(self) -> bool {
        matches!(self, RegionType::Free)
    }
}

bitflags! {
    /// Per-descriptor state bits (spec section 3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u8 {
        /// This record currently represents a live region.
        const IN_USE  = 0x01;
        /// The pool allocation backing this record's storage is owned by
        /// the MDL and may be returned to its pool on destroy. Only ever
        /// set on the first descriptor of a refill batch.
        const FREEABLE = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Color {
    Red,
    Black,
}

/// One descriptor record.
///
/// `tree_*` fields are the ordered-index hook; `link_*` fields are the
/// free-link hook, shared between the size-bucketed free lists and the
/// arena's unused reserve (a descriptor is only ever on one of those at
/// a time, per invariant 4).
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub base_address: u64,
    pub size: u64,
    pub region_type: RegionType,
    pub flags: DescriptorFlags,

    pub(super) tree_parent: u32,
    pub(super) tree_left: u32,
    pub(super) tree_right: u32,
    pub(super) tree_color: Color,

    pub(super) link_prev: u32,
    pub(super) link_next: u32,
}

impl Descriptor {
    /// An empty, not-in-use descriptor record. Used to initialize the
    /// fixed-size arrays callers pass to [`super::DescriptorArena::seed`]
    /// and [`super::Mdl::seed`] before any of the list's own bookkeeping
    /// has touched them.
    pub const fn blank() -> Self {
        Self {
            base_address: 0,
            size: 0,
            region_type: RegionType::Reserved,
            flags: DescriptorFlags::empty(),
            tree_parent: NIL,
            tree_left: NIL,
            tree_right: NIL,
            tree_color: Color::Black,
            link_prev: NIL,
            link_next: NIL,
        }
    }

    pub fn in_use(&self) -> bool {
        self.flags.contains(DescriptorFlags::IN_USE)
    }

    pub fn freeable(&self) -> bool {
        self.flags.contains(DescriptorFlags::FREEABLE)
    }

    pub fn end_address(&self) -> u64 {
        self.base_address + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    pub fn free_like(&self) -> bool {
        self.in_use() && self.region_type.is_free_like()
    }
}
