/*
 * Memory Subsystem Configuration
 *
 * Every magic number the memory core depends on lives here so that the
 * allocators, the page-table engine, and process bootstrap all agree on a
 * single source of truth.
 */

/// Size of a physical frame / page (4 KiB), matching x86-64's base page size.
pub const FRAME_SIZE: u64 = 4096;

/// Kernel virtual base: every physical frame is also reachable at
/// `PAddr + KVIRTUAL_ADDRESS` once the identity-plus-offset mapping is
/// established.
pub const KVIRTUAL_ADDRESS: u64 = 0xFFFF_FFFF_8000_0000;

/// Base virtual address of the PCI/MMIO mapping window. Configurable per
/// platform; this is the default used when no override is supplied.
pub const PCI_VIRTUAL_ADDRESS: u64 = 0xFFFF_FF00_0000_0000;

/// Size, in bytes, of the kernel half of the virtual address space that the
/// virtual-range allocator manages.
pub const VADDR_SIZE: u64 = 256 * 1024 * 1024 * 1024; // 256 GiB

/// Initial size of the kernel heap, mapped eagerly at bootstrap.
pub const KERNEL_HEAP_INITIAL: usize = 1024 * 1024; // 1 MiB

/// Initial size of a freshly created process's heap.
pub const USER_HEAP_INITIAL_SIZE: usize = 1024 * 1024; // 1 MiB

/// Default size of a process's stack.
pub const USER_STACK_SIZE: u64 = 8 * 1024 * 1024; // 8 MiB

/// User-space address layout. Every process is built with this exact
/// partitioning; none of these regions move at runtime.
pub mod user_layout {
    /// NULL-pointer guard region: unmapped, any access traps.
    pub const NULL_GUARD_START: u64 = 0x0000_0000;
    pub const NULL_GUARD_END: u64 = 0x003F_FFFF;

    /// Code and data segment.
    pub const CODE_DATA_START: u64 = 0x0040_0000;
    pub const CODE_DATA_END: u64 = 0x07FF_FFFF;
    pub const CODE_DATA_MAX_SIZE: u64 = 128 * 1024 * 1024; // 128 MiB

    /// User heap.
    pub const HEAP_START: u64 = 0x0800_0000;
    pub const HEAP_END: u64 = 0x3FFF_FFFF;
    pub const HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024; // 1 GiB

    /// mmap-style anonymous mapping region.
    pub const MMAP_START: u64 = 0x4000_0000;
    pub const MMAP_END: u64 = 0x6FFF_FFFF;

    /// Stack, growing down from its top.
    pub const STACK_BOTTOM: u64 = 0x7FF0_0000;
    pub const STACK_TOP: u64 = 0x7FFF_FFFF;

    /// Everything from here up belongs to the kernel half of the address
    /// space and is never mapped user-accessible.
    pub const KERNEL_HALF_START: u64 = 0x8000_0000;
}
