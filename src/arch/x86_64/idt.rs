/*
 * Interrupt Descriptor Table (IDT)
 *
 * Covers the 20 architectural exception vectors. None of them are part of
 * the memory-management core's own logic, but `initialize_memory` cannot
 * run safely without them installed first: an exception during the CR3
 * switch with no IDT loaded is a triple fault.
 *
 * Every handler here is a fatal diagnostic — log what the CPU gave us, then
 * halt. This kernel's heaps are eagerly mapped (no demand paging), so a
 * page fault always indicates a bug rather than a request to service.
 */

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_exceeded_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        idt.security_exception.set_handler_fn(security_exception_handler);

        idt
    };
}

/// Loads the IDT. Must run before memory management, since an exception
/// during the CR3 switch with no IDT loaded triple-faults the CPU.
pub fn init() {
    log::info!("Loading IDT...");
    IDT.load();
    log::info!("IDT loaded successfully");
}

fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    log::error!("DIVIDE_ERROR at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn debug_handler(frame: InterruptStackFrame) {
    log::error!("DEBUG exception at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn nmi_handler(frame: InterruptStackFrame) {
    log::error!("NMI at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::error!("BREAKPOINT at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn overflow_handler(frame: InterruptStackFrame) {
    log::error!("OVERFLOW at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn bound_range_exceeded_handler(frame: InterruptStackFrame) {
    log::error!("BOUND_RANGE_EXCEEDED at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    log::error!("INVALID_OPCODE at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn device_not_available_handler(frame: InterruptStackFrame) {
    log::error!("DEVICE_NOT_AVAILABLE at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn double_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    log::error!(
        "DOUBLE_FAULT (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn invalid_tss_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!(
        "INVALID_TSS (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn segment_not_present_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!(
        "SEGMENT_NOT_PRESENT (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn stack_segment_fault_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!(
        "STACK_SEGMENT_FAULT (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn general_protection_fault_handler(
    frame: InterruptStackFrame,
    error_code: u64,
) {
    log::error!(
        "GENERAL_PROTECTION_FAULT (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

/// Fatal diagnostic only: this kernel's heaps are eagerly mapped, so a page
/// fault never triggers demand allocation — it means a wild or stale
/// pointer reached an unmapped or protected address.
extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read();
    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);

    log::error!(
        "PAGE_FAULT at {:?} (present={} write={} user={}) rip={:?}",
        fault_addr,
        present,
        write,
        user,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn x87_floating_point_handler(frame: InterruptStackFrame) {
    log::error!("X87_FLOATING_POINT at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn alignment_check_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!(
        "ALIGNMENT_CHECK (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    log::error!("MACHINE_CHECK at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn simd_floating_point_handler(frame: InterruptStackFrame) {
    log::error!("SIMD_FLOATING_POINT at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn virtualization_handler(frame: InterruptStackFrame) {
    log::error!("VIRTUALIZATION_EXCEPTION at {:?}", frame.instruction_pointer);
    halt();
}

extern "x86-interrupt" fn security_exception_handler(frame: InterruptStackFrame, error_code: u64) {
    log::error!(
        "SECURITY_EXCEPTION (code=0x{:x}) at {:?}",
        error_code,
        frame.instruction_pointer
    );
    halt();
}
