/*
 * Physical Frame Allocator
 *
 * Bitmap-based allocator over a single contiguous pool of 4 KiB frames,
 * `[start, start + length)`. The pool itself is selected by the bootstrap
 * routine (the largest free region reported by the boot record, see
 * `memory::mod::initialize_memory`) — this module only tracks frames
 * within it.
 *
 * Every frame handed out by `alloc` is zero-filled before its address is
 * returned; every frame returned through `free` is checked against
 * double-free.
 */

use spin::Mutex;

use crate::memory::physmap;
use crate::memory::types::{PhysAddr, PhysFrame};

/// Frame bitmap - each bit represents one 4 KiB frame within the pool.
/// 0 = free, 1 = used.
struct Bitmap {
    words: alloc_free::RawWords,
}

/// Minimal fixed-capacity bitmap storage that does not itself depend on
/// the kernel heap (the heap is constructed using this very allocator).
/// Backed by a placement allocation made once, at `init`.
mod alloc_free {
    pub struct RawWords {
        pub ptr: *mut u64,
        pub len: usize,
    }
    unsafe impl Send for RawWords {}
}

struct PhysicalPool {
    start: u64,
    frame_count: usize,
    bitmap: Bitmap,
}

static POOL: Mutex<Option<PhysicalPool>> = Mutex::new(None);

/// Initializes the physical frame allocator to manage the frame-aligned
/// region `[start, start + length)`. All frames in the region start out
/// free. Bitmap storage itself is carved from the placement allocator,
/// since no other allocator exists yet at this point in bootstrap.
pub fn init(start: PhysAddr, length: u64) {
    let frame_count = (length / PhysFrame::SIZE) as usize;
    let word_count = frame_count.div_ceil(64).max(1);

    let (bitmap_virt, _bitmap_phys) = crate::memory::placement::alloc_with_phys(
        (word_count * core::mem::size_of::<u64>()) as u64,
        8,
    );
    let words_ptr = bitmap_virt.as_mut_ptr::<u64>();
    unsafe {
        core::ptr::write_bytes(words_ptr, 0, word_count);
    }

    log::info!(
        "Physical frame allocator initialized: start=0x{:x}, frames={}",
        start.as_u64(),
        frame_count
    );

    *POOL.lock() = Some(PhysicalPool {
        start: start.as_u64(),
        frame_count,
        bitmap: Bitmap {
            words: alloc_free::RawWords {
                ptr: words_ptr,
                len: word_count,
            },
        },
    });
}

/// Zero-fills a frame's contents through whichever identity-plus-offset
/// access path is currently live (BOOTBOOT identity mapping during
/// bootstrap, physmap afterward).
fn zero_frame(frame: PhysFrame) {
    let phys = PhysAddr::new(frame.start_address());
    let ptr: *mut u8 = if physmap::is_active() {
        unsafe { physmap::phys_ptr(phys) }
    } else {
        phys.as_u64() as *mut u8
    };
    unsafe {
        core::ptr::write_bytes(ptr, 0, PhysFrame::SIZE as usize);
    }
}

/// Allocate a physical frame. The returned frame's contents are zeroed.
/// Returns `None` if the pool is exhausted or not yet initialized.
pub fn alloc_frame() -> Option<PhysFrame> {
    let frame = {
        let mut guard = POOL.lock();
        let pool = guard.as_mut()?;

        let mut result = None;
        'search: for word_idx in 0..pool.bitmap.words.len {
            let word_val = unsafe { *pool.bitmap.words.ptr.add(word_idx) };
            if word_val != u64::MAX {
                for bit_idx in 0..64 {
                    let frame_num = word_idx * 64 + bit_idx;
                    if frame_num >= pool.frame_count {
                        break 'search;
                    }
                    let mask = 1u64 << bit_idx;
                    if (word_val & mask) == 0 {
                        unsafe {
                            *pool.bitmap.words.ptr.add(word_idx) = word_val | mask;
                        }
                        let frame_addr = pool.start + (frame_num as u64) * PhysFrame::SIZE;
                        result = Some(PhysFrame::containing_address(frame_addr));
                        break 'search;
                    }
                }
            }
        }
        result
    };

    if let Some(frame) = frame {
        zero_frame(frame);
    }
    frame
}

/// Free a physical frame. Freeing a frame that is already free, or one
/// outside the managed pool, is a double-free / invalid-address condition:
/// it is logged at CRITICAL and otherwise ignored.
pub fn free_frame(frame: PhysFrame) {
    let mut guard = POOL.lock();
    let Some(pool) = guard.as_mut() else {
        log::error!("free_frame called before physical allocator is initialized");
        return;
    };

    let addr = frame.start_address();
    if addr < pool.start || addr >= pool.start + (pool.frame_count as u64) * PhysFrame::SIZE {
        log::error!("free_frame: address 0x{:x} is outside the managed pool", addr);
        return;
    }

    let frame_num = ((addr - pool.start) / PhysFrame::SIZE) as usize;
    let word_idx = frame_num / 64;
    let bit_idx = frame_num % 64;
    let mask = 1u64 << bit_idx;

    unsafe {
        let word_ptr = pool.bitmap.words.ptr.add(word_idx);
        let word_val = *word_ptr;
        if (word_val & mask) == 0 {
            log::error!("double free of physical frame at 0x{:x}", addr);
            return;
        }
        *word_ptr = word_val & !mask;
    }
}

/// Get statistics about frame usage: (used_frames, total_frames).
pub fn get_stats() -> (usize, usize) {
    let guard = POOL.lock();
    let Some(pool) = guard.as_ref() else {
        return (0, 0);
    };

    let mut used_frames = 0;
    unsafe {
        for i in 0..pool.bitmap.words.len {
            used_frames += (*pool.bitmap.words.ptr.add(i)).count_ones() as usize;
        }
    }
    (used_frames, pool.frame_count)
}

/// Whether the physical allocator has taken over from the placement
/// allocator yet. Consulted by the page-table engine's one-shot
/// intermediate-table allocator switch-over (see `paging::map_4k`).
pub fn is_initialized() -> bool {
    POOL.lock().is_some()
}
