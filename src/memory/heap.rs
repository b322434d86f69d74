/*
 * Kernel Heap
 *
 * Hand-rolled doubly-linked block-list allocator backing the kernel's
 * global allocator. Each live or free block is preceded by a header;
 * `malloc` first-fits the block list and falls back to `expand_heap` when
 * nothing fits.
 */

use spin::Mutex;

use crate::memory::config::{FRAME_SIZE, KERNEL_HEAP_INITIAL};
use crate::memory::types::{PageTableFlags, PhysAddr, VirtAddr};
use crate::memory::{paging, virt};

const MAGIC_FREE: u32 = 0xDEADBEEF;
const MAGIC_USED: u32 = 0xCAFEBABE;

#[repr(C)]
struct BlockHeader {
    size: usize,
    is_free: bool,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    magic: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 16;

struct Stats {
    total_allocated: usize,
    total_free: usize,
    num_allocations: usize,
    num_frees: usize,
}

struct Heap {
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
    root: PhysAddr,
    ranges: virt::Virt,
    stats: Stats,
}

unsafe impl Send for Heap {}

static HEAP: Mutex<Option<Heap>> = Mutex::new(None);

fn map_zone(root: PhysAddr, start: VirtAddr, size: u64) -> Result<(), &'static str> {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    paging::map_range_4k(root, start, size, flags)
}

/// Initializes the kernel heap: reserves `KERNEL_HEAP_INITIAL` bytes from
/// `ranges` (the kernel's shared virtual-range window), maps frames for it,
/// and lays down a single initial free block spanning the whole region.
pub fn init(mut ranges: virt::Virt) -> Result<(), &'static str> {
    let root = paging::get_current_cr3();

    let initial_size = round_up(KERNEL_HEAP_INITIAL as u64, FRAME_SIZE);
    let start = ranges
        .alloc(initial_size)
        .ok_or("failed to reserve initial kernel heap range")?;

    map_zone(root, start, initial_size)?;

    let first = start.as_mut_ptr::<BlockHeader>();
    unsafe {
        first.write(BlockHeader {
            size: initial_size as usize - HEADER_SIZE,
            is_free: true,
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            magic: MAGIC_FREE,
        });
    }

    *HEAP.lock() = Some(Heap {
        head: first,
        tail: first,
        root,
        ranges,
        stats: Stats {
            total_allocated: 0,
            total_free: initial_size as usize - HEADER_SIZE,
            num_allocations: 0,
            num_frees: 0,
        },
    });

    log::info!(
        "Kernel heap initialized at 0x{:x}, {} bytes",
        start.as_u64(),
        initial_size
    );
    Ok(())
}

fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

fn data_ptr(header: *mut BlockHeader) -> *mut u8 {
    unsafe { (header as *mut u8).add(HEADER_SIZE) }
}

fn from_data(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(HEADER_SIZE) as *mut BlockHeader }
}

impl Heap {
    fn expand_heap(&mut self, min_size: usize) -> Result<(), &'static str> {
        let requested = round_up(min_size as u64, FRAME_SIZE);
        let start = self
            .ranges
            .alloc(requested)
            .ok_or("virtual address space exhausted")?;

        if let Err(e) = map_zone(self.root, start, requested) {
            self.ranges.free(start, requested);
            return Err(e);
        }

        let block = start.as_mut_ptr::<BlockHeader>();
        unsafe {
            block.write(BlockHeader {
                size: requested as usize - HEADER_SIZE,
                is_free: true,
                next: core::ptr::null_mut(),
                prev: self.tail,
                magic: MAGIC_FREE,
            });
        }

        // Append to the logical tail of the next-pointer chain, not
        // address order — matches how the block-walk already traverses.
        unsafe {
            (*self.tail).next = block;
        }
        let old_tail = self.tail;
        self.tail = block;
        self.stats.total_free += requested as usize - HEADER_SIZE;

        // Coalesce with the previous tail only if byte-adjacent.
        self.try_coalesce_adjacent(old_tail, block);

        Ok(())
    }

    fn try_coalesce_adjacent(&mut self, left: *mut BlockHeader, right: *mut BlockHeader) {
        unsafe {
            if !(*left).is_free || !(*right).is_free {
                return;
            }
            let left_end = (left as usize) + HEADER_SIZE + (*left).size;
            if left_end != right as usize {
                return;
            }
            (*left).size += HEADER_SIZE + (*right).size;
            (*left).next = (*right).next;
            if !(*right).next.is_null() {
                (*(*right).next).prev = left;
            }
            if self.tail == right {
                self.tail = left;
            }
        }
    }

    fn malloc(&mut self, n: usize) -> *mut u8 {
        if n == 0 {
            return core::ptr::null_mut();
        }
        let n = round_up(n as u64, 8) as usize;

        let mut cur = self.head;
        let mut found: *mut BlockHeader = core::ptr::null_mut();
        while !cur.is_null() {
            unsafe {
                if (*cur).is_free && (*cur).size >= n {
                    found = cur;
                    break;
                }
                cur = (*cur).next;
            }
        }

        if found.is_null() {
            if self.expand_heap(n + HEADER_SIZE).is_err() {
                return core::ptr::null_mut();
            }
            cur = self.head;
            while !cur.is_null() {
                unsafe {
                    if (*cur).is_free && (*cur).size >= n {
                        found = cur;
                        break;
                    }
                    cur = (*cur).next;
                }
            }
            if found.is_null() {
                return core::ptr::null_mut();
            }
        }

        unsafe {
            let block_size = (*found).size;
            if block_size >= n + MIN_BLOCK_SIZE {
                let remainder_addr = (found as usize) + HEADER_SIZE + n;
                let remainder = remainder_addr as *mut BlockHeader;
                remainder.write(BlockHeader {
                    size: block_size - n - HEADER_SIZE,
                    is_free: true,
                    next: (*found).next,
                    prev: found,
                    magic: MAGIC_FREE,
                });
                if !(*found).next.is_null() {
                    (*(*found).next).prev = remainder;
                }
                (*found).next = remainder;
                if self.tail == found {
                    self.tail = remainder;
                }
                (*found).size = n;
            }

            (*found).is_free = false;
            (*found).magic = MAGIC_USED;

            self.stats.total_allocated += (*found).size;
            self.stats.total_free -= (*found).size;
            self.stats.num_allocations += 1;

            data_ptr(found)
        }
    }

    fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            log::error!("kernel heap free: null pointer");
            return;
        }

        let header = from_data(ptr);
        unsafe {
            match (*header).magic {
                MAGIC_USED => {}
                MAGIC_FREE => {
                    log::error!("double free detected at {:p}", ptr);
                    return;
                }
                _ => {
                    log::error!("heap corruption: bad magic at {:p}", ptr);
                    return;
                }
            }

            (*header).is_free = true;
            (*header).magic = MAGIC_FREE;
            self.stats.total_allocated -= (*header).size;
            self.stats.total_free += (*header).size;
            self.stats.num_frees += 1;

            // Coalesce forward then backward; only merge byte-adjacent
            // neighbors, since an unmapped hole can sit between two
            // expansions even when both sides are logically "free".
            let next = (*header).next;
            if !next.is_null() {
                self.try_coalesce_adjacent(header, next);
            }
            let prev = (*header).prev;
            if !prev.is_null() {
                self.try_coalesce_adjacent(prev, header);
            }
        }
    }

    fn realloc(&mut self, ptr: *mut u8, n: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(n);
        }
        if n == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }

        let header = from_data(ptr);
        let n_aligned = round_up(n as u64, 8) as usize;
        unsafe {
            if (*header).size >= n_aligned {
                return ptr;
            }

            let new_ptr = self.malloc(n);
            if new_ptr.is_null() {
                return core::ptr::null_mut();
            }
            let copy_len = core::cmp::min((*header).size, n);
            core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
            self.free(ptr);
            new_ptr
        }
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return core::ptr::null_mut(),
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe {
                core::ptr::write_bytes(ptr, 0, total);
            }
        }
        ptr
    }

    fn aligned_alloc(&mut self, align: usize, n: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return core::ptr::null_mut();
        }
        let raw_size = n + align + core::mem::size_of::<*mut u8>();
        let raw = self.malloc(raw_size);
        if raw.is_null() {
            return core::ptr::null_mut();
        }

        let sentinel_end = unsafe { raw.add(core::mem::size_of::<*mut u8>()) } as usize;
        let aligned = round_up(sentinel_end as u64, align as u64) as usize;
        unsafe {
            let sentinel_slot = (aligned - core::mem::size_of::<*mut u8>()) as *mut *mut u8;
            sentinel_slot.write(raw);
        }
        aligned as *mut u8
    }

    fn free_possibly_aligned(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header = from_data(ptr);
        let magic_is_valid = unsafe { matches!((*header).magic, MAGIC_USED | MAGIC_FREE) };
        if magic_is_valid {
            self.free(ptr);
            return;
        }

        // Not immediately preceded by a block header: this is an
        // aligned_alloc sentinel. Recover the original allocation and
        // free that instead.
        let sentinel_slot = unsafe { (ptr as *mut *mut u8).sub(1) };
        let raw = unsafe { *sentinel_slot };
        self.free(raw);
    }

    fn validate_heap(&self) -> bool {
        let mut total_allocated = 0usize;
        let mut total_free = 0usize;
        let mut num_allocations = 0usize;

        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                match (*cur).magic {
                    MAGIC_FREE | MAGIC_USED => {}
                    _ => return false,
                }
                if (*cur).is_free {
                    total_free += (*cur).size;
                } else {
                    total_allocated += (*cur).size;
                    num_allocations += 1;
                }
                cur = (*cur).next;
            }
        }

        total_allocated == self.stats.total_allocated
            && total_free == self.stats.total_free
            && num_allocations == self.stats.num_allocations - self.stats.num_frees
    }

    fn print_stats(&self) {
        log::info!(
            "heap stats: allocated={} free={} allocations={} frees={}",
            self.stats.total_allocated,
            self.stats.total_free,
            self.stats.num_allocations,
            self.stats.num_frees
        );
    }

    fn dump_blocks(&self) {
        let mut cur = self.head;
        let mut i = 0;
        while !cur.is_null() {
            unsafe {
                log::info!(
                    "block {}: addr={:p} size={} free={} magic=0x{:x}",
                    i,
                    cur,
                    (*cur).size,
                    (*cur).is_free,
                    (*cur).magic
                );
                cur = (*cur).next;
            }
            i += 1;
        }
    }
}

pub fn kmalloc(size: usize) -> *mut u8 {
    HEAP.lock()
        .as_mut()
        .map_or(core::ptr::null_mut(), |h| h.malloc(size))
}

pub fn kfree(ptr: *mut u8) {
    if let Some(h) = HEAP.lock().as_mut() {
        h.free_possibly_aligned(ptr);
    }
}

pub fn krealloc(ptr: *mut u8, size: usize) -> *mut u8 {
    HEAP.lock()
        .as_mut()
        .map_or(core::ptr::null_mut(), |h| h.realloc(ptr, size))
}

pub fn kcalloc(count: usize, size: usize) -> *mut u8 {
    HEAP.lock()
        .as_mut()
        .map_or(core::ptr::null_mut(), |h| h.calloc(count, size))
}

pub fn kmalloc_aligned(align: usize, size: usize) -> *mut u8 {
    HEAP.lock()
        .as_mut()
        .map_or(core::ptr::null_mut(), |h| h.aligned_alloc(align, size))
}

pub fn validate_heap() -> bool {
    HEAP.lock().as_ref().is_some_and(|h| h.validate_heap())
}

pub fn print_stats() {
    if let Some(h) = HEAP.lock().as_ref() {
        h.print_stats();
    }
}

pub fn dump_blocks() {
    if let Some(h) = HEAP.lock().as_ref() {
        h.dump_blocks();
    }
}

struct GlobalHeap;

unsafe impl core::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() <= 8 {
            kmalloc(layout.size())
        } else {
            kmalloc_aligned(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        kfree(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: GlobalHeap = GlobalHeap;

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation failed: {:?}", layout);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_heap(size: usize) -> Heap {
        let buf: &'static mut [u8] = alloc::vec![0u8; size].leak();
        let start = buf.as_mut_ptr() as usize;
        let first = start as *mut BlockHeader;
        unsafe {
            first.write(BlockHeader {
                size: size - HEADER_SIZE,
                is_free: true,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                magic: MAGIC_FREE,
            });
        }
        Heap {
            head: first,
            tail: first,
            root: PhysAddr::new(0),
            ranges: virt::Virt::new(0, 0),
            stats: Stats {
                total_allocated: 0,
                total_free: size - HEADER_SIZE,
                num_allocations: 0,
                num_frees: 0,
            },
        }
    }

    #[test]
    fn malloc_free_round_trip() {
        let mut heap = fresh_heap(4096);
        let before = (heap.stats.total_allocated, heap.stats.total_free);
        let p = heap.malloc(64);
        assert!(!p.is_null());
        heap.free(p);
        assert_eq!((heap.stats.total_allocated, heap.stats.total_free), before);
        assert!(heap.validate_heap());
    }

    #[test]
    fn fragmentation_then_full_coalesce() {
        let mut heap = fresh_heap(4096);
        let initial_free = heap.stats.total_free;
        let a = heap.malloc(128);
        let b = heap.malloc(128);
        let c = heap.malloc(128);
        heap.free(a);
        heap.free(c);
        heap.free(b);
        assert_eq!(heap.stats.total_free, initial_free);
        assert!(heap.validate_heap());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut heap = fresh_heap(4096);
        let p = heap.malloc(32);
        heap.free(p);
        let frees_before = heap.stats.num_frees;
        heap.free(p);
        assert_eq!(heap.stats.num_frees, frees_before);
    }

    #[test]
    fn corrupted_magic_is_detected() {
        let mut heap = fresh_heap(4096);
        let p = heap.malloc(32);
        let header = from_data(p);
        unsafe {
            (*header).magic = 0x1234_5678;
        }
        let allocated_before = heap.stats.total_allocated;
        heap.free(p);
        assert_eq!(heap.stats.total_allocated, allocated_before);
    }

    #[test]
    fn aligned_alloc_is_aligned_and_freeable() {
        let mut heap = fresh_heap(8192);
        let p = heap.aligned_alloc(64, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        heap.free_possibly_aligned(p);
        assert!(heap.validate_heap());
    }
}
