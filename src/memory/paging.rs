/*
 * Page-Table Engine
 *
 * Operations parameterized by a top-level directory `PhysAddr` (no state of
 * their own). Every table is dereferenced through the identity-plus-offset
 * rule: during bootstrap, before physmap is live, BOOTBOOT's own identity
 * mapping stands in for it.
 *
 * ARCHITECTURE:
 * - x86_64 4-level paging: PML4 -> PDPT -> PD -> PT -> 4K page
 * - Each level is 512 entries (9 bits)
 * - Entry format: [physical address (12-51)] | [flags (0-11, 52-63)]
 */

use core::sync::atomic::{AtomicBool, Ordering};

use crate::memory::config::{self, user_layout};
use crate::memory::{
    phys as pmm, physmap, placement,
    types::{PageTableFlags, PhysAddr, PhysFrame, VirtAddr},
};

/// Whether the physical frame allocator has taken over as the source of
/// intermediate page-table frames. Before this flips, `map_4k` carves
/// intermediate tables from the placement allocator. A single one-shot
/// switch, set at the end of bootstrap by `initialize_memory`.
static FRAME_ALLOCATOR_LIVE: AtomicBool = AtomicBool::new(false);

/// Marks the frame allocator as available for intermediate-table
/// allocation. Called exactly once by `initialize_memory`.
pub fn mark_frame_allocator_live() {
    FRAME_ALLOCATOR_LIVE.store(true, Ordering::SeqCst);
}

fn alloc_table_frame() -> Result<PhysAddr, &'static str> {
    if FRAME_ALLOCATOR_LIVE.load(Ordering::SeqCst) {
        let frame = pmm::alloc_frame().ok_or("out of physical memory")?;
        Ok(PhysAddr::new(frame.start_address()))
    } else {
        let (_virt, phys) = placement::alloc_with_phys(PhysFrame::SIZE, PhysFrame::SIZE);
        Ok(phys)
    }
}

/// Get a pointer to physical memory.
///
/// During bootstrap (before physmap is mapped), uses BOOTBOOT's identity
/// mapping. After switching to our own page tables, uses physmap.
///
/// # Safety
/// - During bootstrap: BOOTBOOT must have identity mapped the physical address
/// - After bootstrap: Physmap must be properly set up
#[inline]
unsafe fn phys_ptr<T>(phys: PhysAddr) -> *mut T {
    if physmap::is_active() {
        unsafe { physmap::phys_ptr(phys) }
    } else {
        phys.as_u64() as *mut T
    }
}

/// Page table entry
#[repr(transparent)]
#[derive(Clone, Copy)]
struct PageTableEntry(u64);

impl PageTableEntry {
    fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & 0x000f_ffff_ffff_f000)
    }

    fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        let addr_u64 = addr.as_u64();
        assert!(
            addr_u64 & 0xfff == 0,
            "page table entry address must be 4 KiB aligned, got 0x{:x}",
            addr_u64
        );
        if addr_u64 >= physmap::PHYS_MAP_BASE {
            panic!(
                "attempted to store virtual address 0x{:x} in a page table entry",
                addr_u64
            );
        }
        let addr_bits = addr_u64 & 0x000f_ffff_ffff_f000;
        self.0 = addr_bits | flags.bits();
    }

    fn is_present(&self) -> bool {
        (self.0 & 0x1) != 0
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }
}

/// Page table (512 entries)
#[repr(align(4096))]
struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

/// Extract page table indices from virtual address.
fn page_table_indices(virt: VirtAddr) -> (usize, usize, usize, usize) {
    let addr = virt.as_u64();
    let pml4_idx = ((addr >> 39) & 0x1ff) as usize;
    let pdpt_idx = ((addr >> 30) & 0x1ff) as usize;
    let pd_idx = ((addr >> 21) & 0x1ff) as usize;
    let pt_idx = ((addr >> 12) & 0x1ff) as usize;
    (pml4_idx, pdpt_idx, pd_idx, pt_idx)
}

/// Walk page tables to find the mapping for a virtual address.
pub fn translate(root: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_table_indices(virt);

    let pml4 = unsafe { &*phys_ptr::<PageTable>(root) };
    let pml4e = pml4.entry(pml4_idx);
    if !pml4e.is_present() {
        return None;
    }

    let pdpt = unsafe { &*phys_ptr::<PageTable>(pml4e.addr()) };
    let pdpte = pdpt.entry(pdpt_idx);
    if !pdpte.is_present() {
        return None;
    }

    let pd = unsafe { &*phys_ptr::<PageTable>(pdpte.addr()) };
    let pde = pd.entry(pd_idx);
    if !pde.is_present() {
        return None;
    }

    let pt = unsafe { &*phys_ptr::<PageTable>(pde.addr()) };
    let pte = pt.entry(pt_idx);
    if !pte.is_present() {
        return None;
    }

    let offset = virt.as_u64() & 0xfff;
    Some((PhysAddr::new(pte.addr().as_u64() + offset), pte.flags()))
}

/// Maps a single 4 KiB page, allocating intermediate tables as needed.
/// Mapping over an already-present leaf is an overwrite; the TLB is
/// flushed either way.
pub fn map_4k(
    root: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let virt_aligned = VirtAddr::new(virt.as_u64() & !0xfff);
    let phys_aligned = PhysAddr::new(phys.as_u64() & !0xfff);

    let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_table_indices(virt_aligned);

    // Intermediate directory entries are always Present+Writable, plus
    // User whenever the leaf itself is User (I6).
    let mut table_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        table_flags |= PageTableFlags::USER_ACCESSIBLE;
    }

    let pml4 = unsafe { &mut *phys_ptr::<PageTable>(root) };
    let pdpt_addr = ensure_table(pml4, pml4_idx, table_flags)?;

    let pdpt = unsafe { &mut *phys_ptr::<PageTable>(pdpt_addr) };
    let pd_addr = ensure_table(pdpt, pdpt_idx, table_flags)?;

    let pd = unsafe { &mut *phys_ptr::<PageTable>(pd_addr) };
    let pt_addr = ensure_table(pd, pd_idx, table_flags)?;

    let pt = unsafe { &mut *phys_ptr::<PageTable>(pt_addr) };
    pt.entry_mut(pt_idx)
        .set(phys_aligned, flags | PageTableFlags::PRESENT);

    flush_tlb(virt_aligned);
    Ok(())
}

/// Ensures the table slot at `index` in `table` points at a present,
/// zeroed next-level table, allocating one if absent. Returns its address.
fn ensure_table(
    table: &mut PageTable,
    index: usize,
    table_flags: PageTableFlags,
) -> Result<PhysAddr, &'static str> {
    if table.entry(index).is_present() {
        return Ok(table.entry(index).addr());
    }

    let addr = alloc_table_frame()?;
    let ptr = unsafe { phys_ptr::<PageTable>(addr) };
    unsafe { (*ptr).zero() };
    table.entry_mut(index).set(addr, table_flags);
    Ok(addr)
}

/// Unmaps a single 4 KiB page. Unmapping a non-present leaf, or walking
/// into a non-present intermediate entry, is a logged no-op rather than an
/// error. Does not free intermediate tables.
pub fn unmap_4k(root: PhysAddr, virt: VirtAddr) {
    let virt_aligned = VirtAddr::new(virt.as_u64() & !0xfff);
    let (pml4_idx, pdpt_idx, pd_idx, pt_idx) = page_table_indices(virt_aligned);

    let pml4 = unsafe { &mut *phys_ptr::<PageTable>(root) };
    if !pml4.entry(pml4_idx).is_present() {
        log::error!("unmap: 0x{:x} has no PML4 entry", virt_aligned.as_u64());
        return;
    }

    let pdpt = unsafe { &mut *phys_ptr::<PageTable>(pml4.entry(pml4_idx).addr()) };
    if !pdpt.entry(pdpt_idx).is_present() {
        log::error!("unmap: 0x{:x} has no PDPT entry", virt_aligned.as_u64());
        return;
    }

    let pd = unsafe { &mut *phys_ptr::<PageTable>(pdpt.entry(pdpt_idx).addr()) };
    if !pd.entry(pd_idx).is_present() {
        log::error!("unmap: 0x{:x} has no PD entry", virt_aligned.as_u64());
        return;
    }

    let pt = unsafe { &mut *phys_ptr::<PageTable>(pd.entry(pd_idx).addr()) };
    if !pt.entry(pt_idx).is_present() {
        log::error!("unmap: 0x{:x} is not mapped", virt_aligned.as_u64());
        return;
    }

    pt.entry_mut(pt_idx).clear();
    flush_tlb(virt_aligned);
}

/// Unmaps a single 4 KiB page and returns its backing physical address, if
/// it was mapped. Used by callers (the heap, process teardown) that need
/// to return the frame to the physical allocator themselves.
pub fn unmap_4k_returning_phys(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let phys = translate(root, virt).map(|(p, _)| p);
    if phys.is_some() {
        unmap_4k(root, virt);
    }
    phys
}

/// Maps `size` bytes (rounded up to page granularity) starting at
/// `virt_start`, allocating a fresh physical frame for every page.
pub fn map_range_4k(
    root: PhysAddr,
    virt_start: VirtAddr,
    size: u64,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let page_count = size.div_ceil(config::FRAME_SIZE);
    let mut mapped = 0u64;

    for i in 0..page_count {
        let virt = VirtAddr::new(virt_start.as_u64() + i * config::FRAME_SIZE);
        let frame = match pmm::alloc_frame() {
            Some(f) => f,
            None => {
                rollback_range(root, virt_start, mapped);
                return Err("out of physical memory");
            }
        };
        let phys = PhysAddr::new(frame.start_address());

        if let Err(e) = map_4k(root, virt, phys, flags) {
            pmm::free_frame(frame);
            rollback_range(root, virt_start, mapped);
            return Err(e);
        }
        mapped += 1;
    }

    Ok(())
}

fn rollback_range(root: PhysAddr, virt_start: VirtAddr, mapped_pages: u64) {
    for i in 0..mapped_pages {
        let virt = VirtAddr::new(virt_start.as_u64() + i * config::FRAME_SIZE);
        if let Some(phys) = unmap_4k_returning_phys(root, virt) {
            pmm::free_frame(PhysFrame::containing_address(phys.as_u64()));
        }
    }
}

/// Unmaps `size` bytes (rounded up to page granularity) starting at
/// `virt_start`, returning every backing frame to the physical allocator.
pub fn unmap_range_4k(root: PhysAddr, virt_start: VirtAddr, size: u64) {
    let page_count = size.div_ceil(config::FRAME_SIZE);
    for i in 0..page_count {
        let virt = VirtAddr::new(virt_start.as_u64() + i * config::FRAME_SIZE);
        if let Some(phys) = unmap_4k_returning_phys(root, virt) {
            pmm::free_frame(PhysFrame::containing_address(phys.as_u64()));
        }
    }
}

/// Allocates a new zeroed PML4.
fn alloc_pml4() -> Result<PhysAddr, &'static str> {
    let addr = alloc_table_frame()?;
    let ptr = unsafe { phys_ptr::<PageTable>(addr) };
    unsafe { (*ptr).zero() };
    Ok(addr)
}

/// Copies a single PML4 entry from one root to another.
fn copy_pml4_entry(src_root: PhysAddr, dst_root: PhysAddr, index: usize) {
    let src = unsafe { &*phys_ptr::<PageTable>(src_root) };
    let dst = unsafe { &mut *phys_ptr::<PageTable>(dst_root) };
    *dst.entry_mut(index) = src.entry(index);
}

/// Allocates a zeroed PML4 and copies into it the single kernel PML4 entry
/// that covers `KVIRTUAL_ADDRESS`, so kernel code and data remain mapped
/// in every address space. No other entry is copied.
pub fn create_page_directory() -> Result<PhysAddr, &'static str> {
    let dst = alloc_pml4()?;
    let src = get_current_cr3();
    let (kernel_pml4_idx, _, _, _) = page_table_indices(VirtAddr::new(config::KVIRTUAL_ADDRESS));
    copy_pml4_entry(src, dst, kernel_pml4_idx);
    Ok(dst)
}

/// `create_page_directory` plus pre-mapping of a user stack. If the stack
/// mapping fails, the PML4 frame just allocated for `dir` is freed before
/// the error is propagated.
pub fn create_user_page_directory(stack_size: u64) -> Result<PhysAddr, &'static str> {
    let dir = create_page_directory()?;
    if let Err(e) = setup_user_memory_layout(dir, stack_size) {
        pmm::free_frame(PhysFrame::containing_address(dir.as_u64()));
        return Err(e);
    }
    Ok(dir)
}

/// Pre-maps `stack_size` bytes of stack, User+Writable, just below
/// `STACK_TOP`. On any failure, every page mapped so far is torn down.
fn setup_user_memory_layout(dir: PhysAddr, stack_size: u64) -> Result<(), &'static str> {
    let stack_top = VirtAddr::new(user_layout::STACK_TOP + 1);
    let stack_start = VirtAddr::new(stack_top.as_u64() - stack_size);
    let flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    map_range_4k(dir, stack_start, stack_size, flags)
}

/// Reserves a fixed MMIO window at `PCI_VIRTUAL_ADDRESS + (phys & 0xFFFFF)`
/// and maps `phys` there, kernel-only, non-executable.
pub fn mapio(root: PhysAddr, phys: PhysAddr) -> Result<VirtAddr, &'static str> {
    let window_offset = phys.as_u64() & 0x000F_FFFF;
    let virt = VirtAddr::new(config::PCI_VIRTUAL_ADDRESS + window_offset);
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    map_4k(root, virt, phys, flags)?;
    Ok(virt)
}

/// Reverses `mapio`.
pub fn unmapio(root: PhysAddr, virt: VirtAddr) {
    unmap_4k(root, virt);
}

/// Flush TLB for a specific virtual address.
#[inline]
pub fn flush_tlb(virt: VirtAddr) {
    use x86_64::instructions::tlb;
    tlb::flush(virt);
}

/// Flush entire TLB.
#[inline]
pub fn flush_tlb_all() {
    use x86_64::instructions::tlb;
    tlb::flush_all();
}

/// Switch to a different page table root. Updates CR3, which implicitly
/// flushes the TLB.
pub fn switch_cr3(new_root: PhysAddr) {
    let cr3_value = new_root.as_u64();

    assert!(cr3_value & 0xfff == 0, "CR3 must be 4 KiB aligned, got 0x{:x}", cr3_value);
    assert!(cr3_value != 0, "CR3 cannot be NULL");
    if cr3_value >= physmap::PHYS_MAP_BASE {
        panic!("CR3 0x{:x} is a virtual address, not physical", cr3_value);
    }

    unsafe {
        let mut rflags: u64;
        core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem));
        let interrupts_enabled = (rflags & 0x200) != 0;
        if interrupts_enabled {
            core::arch::asm!("cli", options(nostack, nomem));
        }

        core::arch::asm!("mfence", options(nostack, nomem));
        core::arch::asm!(
            "mov cr3, {0}",
            in(reg) cr3_value,
            options(nostack, preserves_flags)
        );

        if interrupts_enabled {
            core::arch::asm!("sti", options(nostack, nomem));
        }
    }
}

/// Get the currently installed page directory (reads CR3).
pub fn get_current_cr3() -> PhysAddr {
    use x86_64::registers::control::Cr3;
    let (frame, _flags) = Cr3::read();
    frame.start_address()
}

/// Translates a virtual address using BOOTBOOT's identity-mapped page
/// tables. Only valid before the kernel switches to its own page tables.
///
/// # Safety
/// Only safe to use while BOOTBOOT's page tables are active.
pub unsafe fn translate_via_identity(root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    unsafe {
        let virt_u64 = virt.as_u64();
        let pml4_idx = ((virt_u64 >> 39) & 0x1ff) as usize;
        let pdpt_idx = ((virt_u64 >> 30) & 0x1ff) as usize;
        let pd_idx = ((virt_u64 >> 21) & 0x1ff) as usize;
        let pt_idx = ((virt_u64 >> 12) & 0x1ff) as usize;
        let offset = virt_u64 & 0xfff;

        let pml4_ptr = root.as_u64() as *const u64;
        let pml4_entry = core::ptr::read_volatile(pml4_ptr.add(pml4_idx));
        if (pml4_entry & 0x1) == 0 {
            return None;
        }

        let pdpt_addr = pml4_entry & 0x000f_ffff_ffff_f000;
        let pdpt_ptr = pdpt_addr as *const u64;
        let pdpt_entry = core::ptr::read_volatile(pdpt_ptr.add(pdpt_idx));
        if (pdpt_entry & 0x1) == 0 {
            return None;
        }
        if (pdpt_entry & 0x80) != 0 {
            let page_base = pdpt_entry & 0x000f_ffff_c000_0000;
            return Some(PhysAddr::new(page_base + (virt_u64 & 0x3fff_ffff)));
        }

        let pd_addr = pdpt_entry & 0x000f_ffff_ffff_f000;
        let pd_ptr = pd_addr as *const u64;
        let pd_entry = core::ptr::read_volatile(pd_ptr.add(pd_idx));
        if (pd_entry & 0x1) == 0 {
            return None;
        }
        if (pd_entry & 0x80) != 0 {
            let page_base = pd_entry & 0x000f_ffff_ffe0_0000;
            return Some(PhysAddr::new(page_base + (virt_u64 & 0x1f_ffff)));
        }

        let pt_addr = pd_entry & 0x000f_ffff_ffff_f000;
        let pt_ptr = pt_addr as *const u64;
        let pt_entry = core::ptr::read_volatile(pt_ptr.add(pt_idx));
        if (pt_entry & 0x1) == 0 {
            return None;
        }

        let page_base = pt_entry & 0x000f_ffff_ffff_f000;
        Some(PhysAddr::new(page_base + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct AlignedRegion([u8; 1 << 20]);

    static mut PLACEMENT_REGION: AlignedRegion = AlignedRegion([0u8; 1 << 20]);

    fn ensure_placement() {
        if !placement::is_initialized() {
            unsafe {
                let base = core::ptr::addr_of_mut!(PLACEMENT_REGION) as u64;
                placement::init(base, base + core::mem::size_of::<AlignedRegion>() as u64);
            }
        }
    }

    /// Hands out a zeroed, 4 KiB-aligned table-sized region from the test's
    /// own placement pool, standing in for a real physical frame. With
    /// physmap inactive, `phys_ptr` treats this address as directly
    /// dereferenceable, exactly as it does for real physical memory before
    /// the kernel's own page tables are live.
    fn fresh_table_frame() -> PhysAddr {
        ensure_placement();
        let (_virt, phys) = placement::alloc_with_phys(4096, 4096);
        let ptr = unsafe { phys_ptr::<PageTable>(phys) };
        unsafe { (*ptr).zero() };
        phys
    }

    #[test]
    fn map_then_translate_round_trips() {
        let root = fresh_table_frame();
        let leaf = fresh_table_frame();
        let virt = VirtAddr::new(0x1000_2000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        map_4k(root, virt, leaf, flags).unwrap();
        let (resolved, resolved_flags) = translate(root, virt).unwrap();
        assert_eq!(resolved, leaf);
        assert!(resolved_flags.contains(PageTableFlags::PRESENT));
    }

    #[test]
    fn user_flag_propagates_to_intermediate_tables() {
        let root = fresh_table_frame();
        let leaf = fresh_table_frame();
        let virt = VirtAddr::new(0x2000_3000);
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

        map_4k(root, virt, leaf, flags).unwrap();

        let (pml4_idx, pdpt_idx, pd_idx, _) = page_table_indices(virt);
        unsafe {
            let pml4 = &*phys_ptr::<PageTable>(root);
            let pml4e = pml4.entry(pml4_idx);
            assert!(pml4e.flags().contains(PageTableFlags::USER_ACCESSIBLE));

            let pdpt = &*phys_ptr::<PageTable>(pml4e.addr());
            let pdpte = pdpt.entry(pdpt_idx);
            assert!(pdpte.flags().contains(PageTableFlags::USER_ACCESSIBLE));

            let pd = &*phys_ptr::<PageTable>(pdpte.addr());
            assert!(pd.entry(pd_idx).flags().contains(PageTableFlags::USER_ACCESSIBLE));
        }
    }

    #[test]
    fn map_unmap_map_is_idempotent() {
        let root = fresh_table_frame();
        let leaf = fresh_table_frame();
        let virt = VirtAddr::new(0x3000_4000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        map_4k(root, virt, leaf, flags).unwrap();
        assert_eq!(translate(root, virt).map(|(p, _)| p), Some(leaf));

        unmap_4k(root, virt);
        assert!(translate(root, virt).is_none());

        map_4k(root, virt, leaf, flags).unwrap();
        assert_eq!(translate(root, virt).map(|(p, _)| p), Some(leaf));
    }

    #[test]
    fn remapping_a_present_leaf_overwrites_it() {
        let root = fresh_table_frame();
        let first = fresh_table_frame();
        let second = fresh_table_frame();
        let virt = VirtAddr::new(0x4000_5000);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        map_4k(root, virt, first, flags).unwrap();
        map_4k(root, virt, second, flags).unwrap();
        assert_eq!(translate(root, virt).map(|(p, _)| p), Some(second));
    }
}

/// Detects the kernel's physical load base by walking BOOTBOOT's identity
/// page tables for the kernel's own `.text` virtual address.
///
/// # Safety
/// Must be called before switching away from BOOTBOOT's page tables.
pub unsafe fn detect_kernel_physical_base() -> Result<u64, &'static str> {
    unsafe {
        unsafe extern "C" {
            static __text_start: u8;
        }

        let kernel_virt = &__text_start as *const _ as u64;
        let current_cr3 = get_current_cr3();

        let kernel_phys = translate_via_identity(current_cr3, VirtAddr::new(kernel_virt))
            .ok_or("failed to translate kernel virtual address")?;

        Ok(kernel_phys.as_u64())
    }
}
