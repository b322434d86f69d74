/*
 * Memory Management
 *
 * Ties together, leaves first:
 *  - placement: bump allocator used only during bootstrap
 *  - physmap / types: address wrappers and the kernel's identity-plus-offset window
 *  - phys: physical frame allocator
 *  - paging: page-table engine
 *  - virt: virtual-range allocator
 *  - heap: kernel heap
 *  - process: per-process user heap and address space
 *
 * `initialize_memory` constructs A through F in the one order that breaks
 * the bootstrap circularity: placement allocator, then page tables become
 * usable, then the physical allocator (seeded from placement-allocated
 * bitmap storage), then the kernel `virt` window, then the kernel heap.
 */

pub mod config;
pub mod error;
pub mod heap;
pub mod paging;
pub mod phys;
pub mod physmap;
pub mod placement;
pub mod process;
pub mod types;
pub mod virt;

use crate::bootinfo::{BootInfo, MMAP_FREE};
use error::MemoryError;
use types::{PhysAddr, PhysFrame};

/// Reserve the first 8 MiB of any candidate region — low memory the
/// bootstrap processor, BIOS data area, and the kernel image itself may
/// still be touching.
const BOOT_RESERVE: u64 = 8 * 1024 * 1024;
/// Minimum usable region size after reservation; below this, boot fails.
const MIN_USABLE: u64 = 4 * 1024 * 1024;

/// Selects the largest free region in the boot record's memory map that
/// lies entirely above the kernel image, treating the absolute first
/// `BOOT_RESERVE` bytes of physical memory as off-limits — low memory the
/// bootstrap processor, BIOS data area, and the kernel image itself may
/// still be touching, regardless of which free region happens to start
/// there.
fn select_boot_region(info: &BootInfo) -> Option<(u64, u64)> {
    let entries = unsafe { info.mmap_entries() };

    let mut best: Option<(u64, u64)> = None;
    for entry in entries {
        if entry.entry_type() != MMAP_FREE {
            continue;
        }
        let start = entry.region_start();
        let end = start + entry.region_size();
        let usable_start = core::cmp::max(start, BOOT_RESERVE);
        if usable_start >= end {
            continue;
        }
        let usable_size = end - usable_start;

        if best.map_or(true, |(_, best_size)| usable_size > best_size) {
            best = Some((usable_start, usable_size));
        }
    }
    best
}

/// Top-level memory bootstrap. Must run exactly once, before any other
/// kernel subsystem that allocates memory.
pub fn initialize_memory(info: &BootInfo) -> Result<(), MemoryError> {
    log::info!("Initializing memory management...");

    let (region_start, region_size) = select_boot_region(info).ok_or(MemoryError::BootFailure)?;
    if region_size < MIN_USABLE {
        log::error!(
            "boot failure: largest usable region is only {} bytes, need {}",
            region_size,
            MIN_USABLE
        );
        return Err(MemoryError::BootFailure);
    }
    log::info!(
        "Selected boot region: start=0x{:x}, size={} bytes",
        region_start,
        region_size
    );

    // 1) Placement allocator reserves the tail of the chosen region for its
    // own bump-pointer bookkeeping allocations (bitmap storage, virt nodes,
    // intermediate page tables) made before the physical allocator exists.
    let placement_span = core::cmp::min(region_size, 2 * 1024 * 1024);
    placement::init(region_start, region_start + placement_span);

    // 2) Physical frame allocator takes over the remainder of the region.
    let phys_pool_start = region_start + placement_span;
    let phys_pool_size = region_size - placement_span;
    phys::init(PhysAddr::new(phys_pool_start), phys_pool_size);
    paging::mark_frame_allocator_live();

    // 3) Kernel virtual-range allocator over its 256 GiB window. Handed
    // directly to the heap below; the heap is its only consumer so there is
    // no standalone singleton to keep in sync with it.
    let kernel_virt = virt::Virt::new(config::KVIRTUAL_ADDRESS, config::VADDR_SIZE);

    // 4) Kernel heap.
    heap::init(kernel_virt).map_err(|_| MemoryError::OutOfMemory)?;

    let (used, total) = phys::get_stats();
    log::info!(
        "Physical memory: used frames = {}, total frames = {}",
        used,
        total
    );
    Ok(())
}

/// Frees a physical frame allocated by any of the frame-backed allocators
/// above. Shared entry point so callers outside this module don't need to
/// depend on `phys` directly.
pub fn free_frame(frame: PhysFrame) {
    phys::free_frame(frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::MMapEnt;

    /// Builds a byte buffer laid out exactly like a `BootInfo` whose `mmap`
    /// array holds the given entries, and runs `f` against it as `&BootInfo`.
    fn with_synthetic_boot_info<R>(entries: &[MMapEnt], f: impl FnOnce(&BootInfo) -> R) -> R {
        let header_size = crate::bootinfo::MMAP_OFFSET as usize;
        let total_size = header_size + entries.len() * core::mem::size_of::<MMapEnt>();
        let mut buf = alloc::vec![0u8; total_size];

        let size_field = total_size as u32;
        buf[4..8].copy_from_slice(&size_field.to_le_bytes());

        let mmap_ptr = unsafe { buf.as_mut_ptr().add(header_size) as *mut MMapEnt };
        for (i, entry) in entries.iter().enumerate() {
            unsafe { mmap_ptr.add(i).write(*entry) };
        }

        let info = unsafe { &*(buf.as_ptr() as *const BootInfo) };
        f(info)
    }

    fn entry(start: u64, size: u64, ty: u32) -> MMapEnt {
        MMapEnt {
            ptr: start,
            size: size | (ty as u64),
        }
    }

    #[test]
    fn boot_with_64mib_ram_selects_region_above_8mib_reserve() {
        let entries = [entry(0x0, 0x9F000, MMAP_FREE), entry(0x100000, 0x4000000, MMAP_FREE)];
        let (start, size) = with_synthetic_boot_info(&entries, |info| {
            select_boot_region(info).expect("a usable region")
        });

        assert_eq!(start, 0x0080_0000);
        assert!(size >= 56 * 1024 * 1024, "expected >= 56 MiB, got {size}");
    }

    #[test]
    fn region_entirely_below_the_reserve_is_skipped() {
        let entries = [entry(0x0, 0x9F000, MMAP_FREE)];
        let result = with_synthetic_boot_info(&entries, select_boot_region);
        assert!(result.is_none());
    }

    #[test]
    fn non_free_regions_are_ignored() {
        let entries = [
            entry(0x100000, 0x4000000, crate::bootinfo::MMAP_ACPI),
            entry(0x10_000000, 0x1000000, MMAP_FREE),
        ];
        let (start, _) = with_synthetic_boot_info(&entries, |info| {
            select_boot_region(info).expect("a usable region")
        });
        assert_eq!(start, 0x10_000000);
    }
}
