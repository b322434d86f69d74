/*
 * User Heap and Process Memory
 *
 * Structural twin of the kernel heap (`memory::heap`), but rooted in a
 * process's own page directory, mapped Present+Writable+User, and capped at
 * a single 2 GiB allocation. Grows eagerly: every page of an expansion is
 * mapped up front, so a user-mode page fault inside the heap region is
 * always a bug, never a demand-allocation trigger.
 */

use crate::memory::config::{user_layout, FRAME_SIZE, USER_HEAP_INITIAL_SIZE, USER_STACK_SIZE};
use crate::memory::error::MemoryError;
use crate::memory::types::{PageTableFlags, PhysAddr, PhysFrame, VirtAddr};
use crate::memory::{paging, phys, virt};

const MAGIC_FREE: u32 = 0xAA00_0000;
const MAGIC_USED: u32 = 0x5500_0000;
const MAGIC_MASK: u32 = 0xFF00_0000;
const MAX_SINGLE_ALLOC: u32 = 0x8000_0000;

#[repr(C)]
struct UserBlockHeader {
    size: u32,
    flags: u32,
    next: *mut UserBlockHeader,
    prev: *mut UserBlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<UserBlockHeader>();
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 16;

fn is_free(flags: u32) -> bool {
    (flags & MAGIC_MASK) == MAGIC_FREE
}

fn magic_is_valid(flags: u32) -> bool {
    matches!(flags & MAGIC_MASK, MAGIC_FREE | MAGIC_USED)
}

fn data_ptr(header: *mut UserBlockHeader) -> *mut u8 {
    unsafe { (header as *mut u8).add(HEADER_SIZE) }
}

fn from_data(ptr: *mut u8) -> *mut UserBlockHeader {
    unsafe { ptr.sub(HEADER_SIZE) as *mut UserBlockHeader }
}

fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// Per-process heap, structurally identical to the kernel heap but keyed to
/// that process's page directory and a 32-bit packed header.
pub struct UserAllocator {
    head: *mut UserBlockHeader,
    tail: *mut UserBlockHeader,
    root: PhysAddr,
    ranges: virt::Virt,
}

unsafe impl Send for UserAllocator {}

impl UserAllocator {
    /// Reserves `size` bytes from `ranges`, maps them User+Writable, and
    /// lays down one free block spanning the region.
    fn new(root: PhysAddr, mut ranges: virt::Virt, size: u64) -> Result<Self, MemoryError> {
        let mapped_size = round_up(size, FRAME_SIZE);
        let start = ranges.alloc(mapped_size).ok_or(MemoryError::AddressSpaceExhausted)?;

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        if paging::map_range_4k(root, start, mapped_size, flags).is_err() {
            ranges.free(start, mapped_size);
            return Err(MemoryError::OutOfMemory);
        }

        let first = start.as_mut_ptr::<UserBlockHeader>();
        unsafe {
            first.write(UserBlockHeader {
                size: (mapped_size as usize - HEADER_SIZE) as u32,
                flags: MAGIC_FREE,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
            });
        }

        Ok(UserAllocator {
            head: first,
            tail: first,
            root,
            ranges,
        })
    }

    fn expand_heap(&mut self, min_size: usize) -> Result<(), MemoryError> {
        let requested = round_up(min_size as u64, FRAME_SIZE);
        let start = self.ranges.alloc(requested).ok_or(MemoryError::AddressSpaceExhausted)?;

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        if paging::map_range_4k(self.root, start, requested, flags).is_err() {
            self.ranges.free(start, requested);
            return Err(MemoryError::OutOfMemory);
        }

        let block = start.as_mut_ptr::<UserBlockHeader>();
        unsafe {
            block.write(UserBlockHeader {
                size: (requested as usize - HEADER_SIZE) as u32,
                flags: MAGIC_FREE,
                next: core::ptr::null_mut(),
                prev: self.tail,
            });
            (*self.tail).next = block;
        }
        let old_tail = self.tail;
        self.tail = block;
        self.try_coalesce_adjacent(old_tail, block);
        Ok(())
    }

    fn try_coalesce_adjacent(&mut self, left: *mut UserBlockHeader, right: *mut UserBlockHeader) {
        unsafe {
            if !is_free((*left).flags) || !is_free((*right).flags) {
                return;
            }
            let left_end = (left as usize) + HEADER_SIZE + (*left).size as usize;
            if left_end != right as usize {
                return;
            }
            (*left).size += HEADER_SIZE as u32 + (*right).size;
            (*left).next = (*right).next;
            if !(*right).next.is_null() {
                (*(*right).next).prev = left;
            }
            if self.tail == right {
                self.tail = left;
            }
        }
    }

    pub fn malloc(&mut self, n: usize) -> Result<*mut u8, MemoryError> {
        if n == 0 || n as u32 > MAX_SINGLE_ALLOC {
            return Err(MemoryError::BadArgument);
        }
        let n = round_up(n as u64, 8) as usize;

        let mut cur = self.head;
        let mut found: *mut UserBlockHeader = core::ptr::null_mut();
        while !cur.is_null() {
            unsafe {
                if is_free((*cur).flags) && (*cur).size as usize >= n {
                    found = cur;
                    break;
                }
                cur = (*cur).next;
            }
        }

        if found.is_null() {
            self.expand_heap(n + HEADER_SIZE)?;
            cur = self.head;
            while !cur.is_null() {
                unsafe {
                    if is_free((*cur).flags) && (*cur).size as usize >= n {
                        found = cur;
                        break;
                    }
                    cur = (*cur).next;
                }
            }
            if found.is_null() {
                return Err(MemoryError::OutOfMemory);
            }
        }

        unsafe {
            let block_size = (*found).size as usize;
            if block_size >= n + MIN_BLOCK_SIZE {
                let remainder_addr = (found as usize) + HEADER_SIZE + n;
                let remainder = remainder_addr as *mut UserBlockHeader;
                remainder.write(UserBlockHeader {
                    size: (block_size - n - HEADER_SIZE) as u32,
                    flags: MAGIC_FREE,
                    next: (*found).next,
                    prev: found,
                });
                if !(*found).next.is_null() {
                    (*(*found).next).prev = remainder;
                }
                (*found).next = remainder;
                if self.tail == found {
                    self.tail = remainder;
                }
                (*found).size = n as u32;
            }
            (*found).flags = MAGIC_USED;
            Ok(data_ptr(found))
        }
    }

    pub fn free(&mut self, ptr: *mut u8) -> Result<(), MemoryError> {
        if ptr.is_null() {
            log::error!("user heap free: null pointer");
            return Err(MemoryError::InvalidAddress);
        }
        let header = from_data(ptr);
        unsafe {
            if !magic_is_valid((*header).flags) {
                log::error!("user heap corruption: bad magic at {:p}", ptr);
                return Err(MemoryError::HeapCorruption);
            }
            if is_free((*header).flags) {
                log::error!("double free detected at {:p}", ptr);
                return Err(MemoryError::HeapCorruption);
            }
            (*header).flags = MAGIC_FREE;

            let next = (*header).next;
            if !next.is_null() {
                self.try_coalesce_adjacent(header, next);
            }
            let prev = (*header).prev;
            if !prev.is_null() {
                self.try_coalesce_adjacent(prev, header);
            }
        }
        Ok(())
    }

    pub fn realloc(&mut self, ptr: *mut u8, n: usize) -> Result<*mut u8, MemoryError> {
        if ptr.is_null() {
            return self.malloc(n);
        }
        if n == 0 {
            self.free(ptr)?;
            return Ok(core::ptr::null_mut());
        }
        let header = from_data(ptr);
        let n_aligned = round_up(n as u64, 8) as usize;
        unsafe {
            if (*header).size as usize >= n_aligned {
                return Ok(ptr);
            }
        }
        let new_ptr = self.malloc(n)?;
        unsafe {
            let copy_len = core::cmp::min((*header).size as usize, n);
            core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }

    pub fn calloc(&mut self, count: usize, size: usize) -> Result<*mut u8, MemoryError> {
        let total = count.checked_mul(size).ok_or(MemoryError::BadArgument)?;
        let ptr = self.malloc(total)?;
        unsafe {
            core::ptr::write_bytes(ptr, 0, total);
        }
        Ok(ptr)
    }
}

/// Complete per-process memory state: page directory, stack, and heap.
pub struct ProcessMemory {
    pub page_dir: PhysAddr,
    pub stack_top: VirtAddr,
    pub stack_size: u64,
    pub heap: UserAllocator,
    mmap_ranges: virt::Virt,
}

unsafe impl Send for ProcessMemory {}

impl ProcessMemory {
    /// Constructs a fresh process address space: page directory, pre-mapped
    /// stack, and an eagerly-mapped heap of `USER_HEAP_INITIAL_SIZE`. Any
    /// failure partway through rolls back everything already committed.
    pub fn new() -> Result<Self, MemoryError> {
        let page_dir = paging::create_user_page_directory(USER_STACK_SIZE)
            .map_err(|_| MemoryError::OutOfMemory)?;

        let ranges = virt::Virt::new(user_layout::HEAP_START, user_layout::HEAP_MAX_SIZE);
        let heap = match UserAllocator::new(page_dir, ranges, USER_HEAP_INITIAL_SIZE as u64) {
            Ok(h) => h,
            Err(e) => {
                paging::unmap_range_4k(
                    page_dir,
                    VirtAddr::new(VirtAddr::new(user_layout::STACK_TOP + 1).as_u64() - USER_STACK_SIZE),
                    USER_STACK_SIZE,
                );
                phys::free_frame(PhysFrame::containing_address(page_dir.as_u64()));
                return Err(e);
            }
        };

        let mmap_span = user_layout::MMAP_END - user_layout::MMAP_START + 1;
        let mmap_ranges = virt::Virt::new(user_layout::MMAP_START, mmap_span);

        Ok(ProcessMemory {
            page_dir,
            stack_top: VirtAddr::new(user_layout::STACK_TOP + 1),
            stack_size: USER_STACK_SIZE,
            heap,
            mmap_ranges,
        })
    }

    /// Reserves and eagerly maps `size` bytes (rounded to page granularity)
    /// of anonymous, User+Writable memory from the mmap window.
    pub fn mmap(&mut self, size: u64) -> Result<VirtAddr, MemoryError> {
        let mapped_size = round_up(size, FRAME_SIZE);
        let start = self
            .mmap_ranges
            .alloc(mapped_size)
            .ok_or(MemoryError::AddressSpaceExhausted)?;

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        if paging::map_range_4k(self.page_dir, start, mapped_size, flags).is_err() {
            self.mmap_ranges.free(start, mapped_size);
            return Err(MemoryError::OutOfMemory);
        }
        Ok(start)
    }

    /// Unmaps `size` bytes starting at `addr`, freeing every backing frame
    /// and returning the range to the mmap window's free list.
    pub fn munmap(&mut self, addr: VirtAddr, size: u64) {
        let mapped_size = round_up(size, FRAME_SIZE);
        paging::unmap_range_4k(self.page_dir, addr, mapped_size);
        self.mmap_ranges.free(addr, mapped_size);
    }
}

impl Drop for ProcessMemory {
    /// Walks the full page-table hierarchy, frees every mapped frame, then
    /// frees the PML4 frame itself.
    fn drop(&mut self) {
        let pml4_ptr = self.page_dir.as_u64() as *const u64;
        for pml4_idx in 0..512usize {
            let pml4e = unsafe { core::ptr::read_volatile(pml4_ptr.add(pml4_idx)) };
            if pml4e & 0x1 == 0 {
                continue;
            }
            // Skip the single shared kernel entry; it is never owned by
            // this address space.
            let kernel_idx = ((crate::memory::config::KVIRTUAL_ADDRESS >> 39) & 0x1ff) as usize;
            if pml4_idx == kernel_idx {
                continue;
            }

            let pdpt_addr = pml4e & 0x000f_ffff_ffff_f000;
            let pdpt_ptr = pdpt_addr as *const u64;
            for pdpt_idx in 0..512usize {
                let pdpte = unsafe { core::ptr::read_volatile(pdpt_ptr.add(pdpt_idx)) };
                if pdpte & 0x1 == 0 {
                    continue;
                }
                let pd_addr = pdpte & 0x000f_ffff_ffff_f000;
                let pd_ptr = pd_addr as *const u64;
                for pd_idx in 0..512usize {
                    let pde = unsafe { core::ptr::read_volatile(pd_ptr.add(pd_idx)) };
                    if pde & 0x1 == 0 {
                        continue;
                    }
                    let pt_addr = pde & 0x000f_ffff_ffff_f000;
                    let pt_ptr = pt_addr as *const u64;
                    for pt_idx in 0..512usize {
                        let pte = unsafe { core::ptr::read_volatile(pt_ptr.add(pt_idx)) };
                        if pte & 0x1 == 0 {
                            continue;
                        }
                        let frame_addr = pte & 0x000f_ffff_ffff_f000;
                        phys::free_frame(PhysFrame::containing_address(frame_addr));
                    }
                    phys::free_frame(PhysFrame::containing_address(pt_addr));
                }
                phys::free_frame(PhysFrame::containing_address(pd_addr));
            }
            phys::free_frame(PhysFrame::containing_address(pdpt_addr));
        }

        phys::free_frame(PhysFrame::containing_address(self.page_dir.as_u64()));
    }
}

/// Rejects null/overflowing pointers, the NULL-guard region, and any
/// address in the kernel-canonical half. Does not verify page-table
/// presence.
pub fn validate_user_pointer(p: u64, n: u64) -> bool {
    if p == 0 {
        return false;
    }
    let end = match p.checked_add(n) {
        Some(e) => e,
        None => return false,
    };
    if end < p {
        return false;
    }
    if p <= user_layout::NULL_GUARD_END {
        return false;
    }
    const KERNEL_HALF_BOUNDARY: u64 = 1 << 47;
    if p >= KERNEL_HALF_BOUNDARY {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_guard_and_kernel_half_rejected() {
        assert!(!validate_user_pointer(0x3FFFFF, 1));
        assert!(validate_user_pointer(0x400000, 1));
        assert!(!validate_user_pointer(0x7FFF_FFFF_FFFFF, 1));
    }

    #[test]
    fn overflowing_range_rejected() {
        assert!(!validate_user_pointer(u64::MAX - 4, 16));
    }

    /// A `UserAllocator` over a plain host buffer, bypassing `new`'s
    /// page-table mapping so the block-list logic can be exercised without
    /// a live process address space.
    fn fresh_allocator(size: usize) -> UserAllocator {
        let buf: &'static mut [u8] = alloc::vec![0u8; size].leak();
        let start = buf.as_mut_ptr() as usize;
        let first = start as *mut UserBlockHeader;
        unsafe {
            first.write(UserBlockHeader {
                size: (size - HEADER_SIZE) as u32,
                flags: MAGIC_FREE,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
            });
        }
        UserAllocator {
            head: first,
            tail: first,
            root: PhysAddr::new(0),
            ranges: virt::Virt::new(0, 0),
        }
    }

    #[test]
    fn malloc_free_round_trip() {
        let mut ua = fresh_allocator(4096);
        let p = ua.malloc(64).unwrap();
        assert!(!p.is_null());
        assert!(ua.free(p).is_ok());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut ua = fresh_allocator(4096);
        let p = ua.malloc(32).unwrap();
        ua.free(p).unwrap();
        assert!(matches!(ua.free(p), Err(MemoryError::HeapCorruption)));
    }

    #[test]
    fn over_cap_allocation_is_rejected() {
        let mut ua = fresh_allocator(4096);
        assert!(matches!(
            ua.malloc(MAX_SINGLE_ALLOC as usize + 1),
            Err(MemoryError::BadArgument)
        ));
    }

    #[test]
    fn fragmentation_then_full_coalesce() {
        let mut ua = fresh_allocator(4096);
        let a = ua.malloc(128).unwrap();
        let b = ua.malloc(128).unwrap();
        let c = ua.malloc(128).unwrap();
        ua.free(a).unwrap();
        ua.free(c).unwrap();
        ua.free(b).unwrap();
        // Fully coalesced back into one free block spanning the buffer.
        assert_eq!(unsafe { (*ua.head).size }, 4096 - HEADER_SIZE as u32);
        assert!(ua.head == ua.tail);
    }
}
