/*
 * Memory Syscall Handlers
 *
 * Because process scheduling is out of scope, these take an explicit
 * `&mut ProcessMemory` rather than resolving "the current process" from a
 * scheduler. The syscall-number-to-handler mapping and argument marshaling
 * are otherwise exactly as a real dispatch table would do it.
 */

use crate::memory::process::{validate_user_pointer, ProcessMemory};
use crate::memory::types::VirtAddr;
use crate::syscall::numbers::{EINVAL, ENOMEM};

pub fn sys_malloc(mem: &mut ProcessMemory, size: usize) -> isize {
    match mem.heap.malloc(size) {
        Ok(ptr) => ptr as isize,
        Err(_) => 0,
    }
}

pub fn sys_free(mem: &mut ProcessMemory, ptr: *mut u8) -> isize {
    if !ptr.is_null() && !validate_user_pointer(ptr as u64, 1) {
        return -EINVAL;
    }
    match mem.heap.free(ptr) {
        Ok(()) => 0,
        Err(_) => -EINVAL,
    }
}

pub fn sys_realloc(mem: &mut ProcessMemory, ptr: *mut u8, size: usize) -> isize {
    match mem.heap.realloc(ptr, size) {
        Ok(p) => p as isize,
        Err(_) => 0,
    }
}

pub fn sys_calloc(mem: &mut ProcessMemory, count: usize, size: usize) -> isize {
    match mem.heap.calloc(count, size) {
        Ok(ptr) => ptr as isize,
        Err(_) => 0,
    }
}

/// Grows or shrinks the process heap by `increment` bytes via `malloc`'s
/// expansion path, returning the new break address or -1 on failure.
pub fn sys_brk(mem: &mut ProcessMemory, increment: isize) -> isize {
    if increment <= 0 {
        return -EINVAL;
    }
    match mem.heap.malloc(increment as usize) {
        Ok(ptr) => ptr as isize,
        Err(_) => -ENOMEM,
    }
}

pub fn sys_mmap(mem: &mut ProcessMemory, size: usize) -> isize {
    if size == 0 {
        return -EINVAL;
    }
    match mem.mmap(size as u64) {
        Ok(addr) => addr.as_u64() as isize,
        Err(_) => -ENOMEM,
    }
}

pub fn sys_munmap(mem: &mut ProcessMemory, addr: usize, size: usize) -> isize {
    if size == 0 {
        return -EINVAL;
    }
    mem.munmap(VirtAddr::new(addr as u64), size as u64);
    0
}
