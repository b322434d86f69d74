/*
 * Placement (Bump) Allocator
 *
 * Bootstrap-only allocator that hands out memory by bumping a pointer
 * forward. It exists to break the circularity of bootstrapping a real
 * memory manager: the frame bitmap, the page tables that back it, and the
 * virtual-range allocator's own node storage all need *some* memory before
 * any of those subsystems are usable. The placement allocator serves that
 * memory out of a fixed region that the boot record guarantees is free and
 * below the 1 MiB legacy boundary concerns of real frame tracking.
 *
 * Individual allocations are not meant to be freed in the general case; the
 * physical frame allocator reclaims the whole bump region in bulk once it
 * takes over (see `initialize_memory`). The one exception is unwinding: a
 * caller that made the *last* placement allocation and then failed can step
 * the cursor back with `free_block` rather than leaking that slice of the
 * bump region for the rest of boot.
 */

use spin::Mutex;

use crate::memory::physmap;
use crate::memory::types::{PhysAddr, VirtAddr};

struct PlacementState {
    start: u64,
    next: u64,
    end: u64,
}

static PLACEMENT: Mutex<Option<PlacementState>> = Mutex::new(None);

/// Initializes the placement allocator over `[phys_start, phys_end)`.
///
/// Must be called exactly once, before any other memory subsystem runs.
pub fn init(phys_start: u64, phys_end: u64) {
    assert!(phys_start < phys_end, "placement region must be non-empty");
    *PLACEMENT.lock() = Some(PlacementState {
        start: phys_start,
        next: phys_start,
        end: phys_end,
    });
}

/// Whether the placement allocator has been initialized yet.
pub fn is_initialized() -> bool {
    PLACEMENT.lock().is_some()
}

/// Allocates `size` bytes aligned to `align` (must be a power of two),
/// returning both a kernel-accessible virtual address and the backing
/// physical address.
///
/// # Panics
/// Panics if the placement region is exhausted or uninitialized.
pub fn alloc_with_phys(size: u64, align: u64) -> (VirtAddr, PhysAddr) {
    debug_assert!(align.is_power_of_two());
    let mut guard = PLACEMENT.lock();
    let state = guard.as_mut().expect("placement allocator not initialized");

    let aligned = (state.next + align - 1) & !(align - 1);
    let new_next = aligned
        .checked_add(size)
        .expect("placement allocator overflow");
    assert!(
        new_next <= state.end,
        "placement allocator exhausted: requested 0x{:x} bytes, {} remaining",
        size,
        state.end - state.next
    );
    state.next = new_next;

    let phys = PhysAddr::new(aligned);
    let virt = if physmap::is_active() {
        physmap::phys_to_virt(phys)
    } else {
        VirtAddr::new(aligned)
    };
    (virt, phys)
}

/// Allocates `size` bytes aligned to `align`, returning only the virtual
/// address.
pub fn alloc(size: u64, align: u64) -> VirtAddr {
    alloc_with_phys(size, align).0
}

/// Returns the physical address of the next byte that would be handed out.
/// Used by the frame allocator to know where the bootstrap region ends so
/// it can mark the consumed frames used and reclaim the remainder.
pub fn current() -> PhysAddr {
    let guard = PLACEMENT.lock();
    let next = guard.as_ref().map_or(0, |s| s.next);
    PhysAddr::new(next)
}

/// Unwinds the last placement allocation by stepping the cursor backward by
/// `size`, so a caller that fails partway through a multi-step bootstrap
/// operation can give its placement allocation back rather than leaking it
/// for the rest of boot. Only meaningful for the most recent allocation;
/// this is a bump pointer, not a general-purpose free list.
///
/// Refuses to rewind past the region's `start` or past `addr` not matching
/// the expected cursor position, logging and leaving the cursor untouched
/// instead.
pub fn free_block(addr: PhysAddr, size: u64) {
    let mut guard = PLACEMENT.lock();
    let Some(state) = guard.as_mut() else {
        log::error!("placement free_block called before the allocator is initialized");
        return;
    };

    let addr_u64 = addr.as_u64();
    if addr_u64 != state.next.saturating_sub(size) || addr_u64 < state.start {
        log::error!(
            "placement free_block: 0x{:x} (size {}) is not the most recent allocation, cursor at 0x{:x}",
            addr_u64,
            size,
            state.next
        );
        return;
    }

    state.next = addr_u64;
}
