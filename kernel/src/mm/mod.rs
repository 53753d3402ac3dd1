//! Kernel memory management entry points.
//!
//! Stands the memory descriptor list up twice over: once against a
//! small boot-time reserve before any pool exists (so the very first
//! `insert()` calls that fold in the firmware memory map have
//! somewhere to draw descriptor records from), and again, once `pool`
//! is online, by switching that same list's arena over to pulling its
//! own refill batches from the non-paged pool.

pub mod mdl;
pub mod pool;

extern crate alloc;

use spin::Mutex;

pub use mdl::{AllocStrategy, Mdl, MdlAudit, MdlError, PoolSource, RegionType};

use mdl::{Descriptor, PoolBackend, BATCH_SIZE};
use pool::{KernelPoolBackend, PoolType};

/// Descriptor records handed to the list before any pool exists. Sized
/// above the memory map entry count a typical UEFI firmware reports,
/// since every additional kernel-reserved range (loaded image, boot
/// page tables, ...) also needs one of its own.
const BOOT_SEED_COUNT: usize = 128;

static mut BOOT_SEED: [Descriptor; BOOT_SEED_COUNT] = [Descriptor::blank(); BOOT_SEED_COUNT];

/// The memory descriptor list and the pool backend its arena refills
/// through, held together so a caller can never observe one without
/// the other.
struct MmState {
    mdl: Mdl,
    backend: KernelPoolBackend,
}

static MM_STATE: Mutex<Option<MmState>> = Mutex::new(None);

/// A backend that never supplies a refill batch. Used only while
/// folding the firmware map in, before the pool allocator exists; the
/// boot seed is sized to never need a refill during that window.
struct NullBackend;

impl PoolBackend for NullBackend {
    fn alloc_batch(&mut self, _tag: u32) -> Option<alloc::boxed::Box<[Descriptor; BATCH_SIZE]>> {
        None
    }
    fn free_batch(&mut self, _batch: alloc::boxed::Box<[Descriptor; BATCH_SIZE]>) {}
}

/// UEFI memory type tags, as reported in the `Type` field of each
/// `EFI_MEMORY_DESCRIPTOR` in the bootloader's handed-down memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EfiMemoryType {
    Reserved,
    LoaderCode,
    LoaderData,
    BootServicesCode,
    BootServicesData,
    RuntimeServicesCode,
    RuntimeServicesData,
    Conventional,
    Unusable,
    AcpiReclaim,
    AcpiNvs,
    MemoryMappedIo,
    MemoryMappedIoPortSpace,
    PalCode,
    Persistent,
}

impl EfiMemoryType {
    fn from_raw(value: u32) -> Option<Self> {
        use EfiMemoryType::*;
        Some(match value {
            0 => Reserved,
            1 => LoaderCode,
            2 => LoaderData,
            3 => BootServicesCode,
            4 => BootServicesData,
            5 => RuntimeServicesCode,
            6 => RuntimeServicesData,
            7 => Conventional,
            8 => Unusable,
            9 => AcpiReclaim,
            10 => AcpiNvs,
            11 => MemoryMappedIo,
            12 => MemoryMappedIoPortSpace,
            13 => PalCode,
            14 => Persistent,
            _ => return None,
        })
    }

    fn region_type(self) -> RegionType {
        use EfiMemoryType::*;
        match self {
            Conventional => RegionType::Free,
            LoaderCode | LoaderData => RegionType::LoaderTemporary,
            BootServicesCode | BootServicesData => RegionType::FirmwareTemporary,
            RuntimeServicesCode | RuntimeServicesData | PalCode => RegionType::FirmwarePermanent,
            AcpiReclaim => RegionType::AcpiTables,
            AcpiNvs => RegionType::AcpiNvs,
            Unusable => RegionType::Bad,
            MemoryMappedIo | MemoryMappedIoPortSpace => RegionType::Hardware,
            Reserved | Persistent => RegionType::Reserved,
        }
    }
}

/// Walk the firmware-reported memory map, inserting each entry as the
/// `RegionType` its EFI memory type maps to. Strides by
/// `memory_map_entry_size` rather than the size of our own read-out
/// layout, since UEFI reserves room in each descriptor for fields
/// newer firmware may add; `Type` (offset 0), `PhysicalStart` (offset
/// 8) and `NumberOfPages` (offset 24) are the only fields this needs,
/// and their offsets are fixed by the UEFI spec regardless of stride.
unsafe fn fold_memory_map(list: &mut Mdl, boot_info: &crate::BootInfo, backend: &mut dyn PoolBackend) {
    let stride = boot_info.memory_map_entry_size as usize;
    if stride == 0 || boot_info.memory_map_addr == 0 {
        return;
    }
    let base = boot_info.memory_map_addr as *const u8;

    for i in 0..boot_info.memory_map_entries {
        let entry = base.add(i as usize * stride);
        let raw_type = core::ptr::read_unaligned(entry as *const u32);
        let physical_start = core::ptr::read_unaligned(entry.add(8) as *const u64);
        let number_of_pages = core::ptr::read_unaligned(entry.add(24) as *const u64);

        if number_of_pages == 0 {
            continue;
        }
        let region_type = EfiMemoryType::from_raw(raw_type)
            .map(EfiMemoryType::region_type)
            .unwrap_or(RegionType::Reserved);
        let size = number_of_pages * mdl::PAGE_SIZE;

        if let Err(e) = list.insert(physical_start, size, region_type, backend) {
            crate::serial_println!(
                "[MM] Failed to insert memory map entry {:#x}+{:#x} ({:?}): {:?}",
                physical_start, size, region_type, e
            );
        }
    }
}

/// Bring the memory manager online.
///
/// # Safety
/// Must be called exactly once, early in `kernel_main`, with a valid
/// `boot_info` whose memory map fields describe memory this kernel
/// actually owns.
pub unsafe fn init(boot_info: &crate::BootInfo) {
    let mut list = Mdl::init(PoolSource::None);
    let seed: &'static mut [Descriptor] = &mut *core::ptr::addr_of_mut!(BOOT_SEED);
    list.seed(seed);

    let mut null_backend = NullBackend;
    fold_memory_map(&mut list, boot_info, &mut null_backend);

    if boot_info.kernel_size > 0 {
        if let Err(e) = list.insert(
            boot_info.kernel_physical_base,
            boot_info.kernel_size,
            RegionType::LoaderPermanent,
            &mut null_backend,
        ) {
            crate::serial_println!("[MM] Failed to reserve kernel image range: {:?}", e);
        }
    }
    if boot_info.pml4_physical_addr != 0 {
        if let Err(e) = list.insert(
            boot_info.pml4_physical_addr,
            mdl::PAGE_SIZE,
            RegionType::BootPageTables,
            &mut null_backend,
        ) {
            crate::serial_println!("[MM] Failed to reserve boot PML4 page: {:?}", e);
        }
    }

    pool::init();
    list.set_pool_source(PoolSource::NonPagedPool);

    *MM_STATE.lock() = Some(MmState {
        mdl: list,
        backend: KernelPoolBackend { pool_type: PoolType::NonPagedPool },
    });
}

/// Print the memory descriptor list and its consistency audit.
pub fn mdl_print() -> Option<MdlAudit> {
    MM_STATE.lock().as_ref().map(|s| s.mdl.print())
}

/// Allocate `size` bytes of non-paged pool backing from the list,
/// page-aligned, using `strategy` to pick among fitting free regions.
pub fn mdl_allocate(size: u64, strategy: AllocStrategy) -> Result<u64, MdlError> {
    let mut guard = MM_STATE.lock();
    let state = guard.as_mut().expect("mm::init not called");
    state
        .mdl
        .allocate(size, mdl::PAGE_SIZE, RegionType::NonPagedPool, strategy, &mut state.backend)
}

/// Whether `[base, end)` is covered by a single free region.
pub fn mdl_is_range_free(base: u64, end: u64) -> bool {
    MM_STATE.lock().as_ref().map(|s| s.mdl.is_range_free(base, end)).unwrap_or(false)
}

/// Release `[base, end)` back to the free pool of available addresses.
pub fn mdl_free(base: u64, end: u64) -> Result<(), MdlError> {
    let mut guard = MM_STATE.lock();
    let state = guard.as_mut().expect("mm::init not called");
    state.mdl.insert(base, end - base, RegionType::Free, &mut state.backend)
}
