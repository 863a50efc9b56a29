//! Register and stack capture at the allocation call site.
//!
//! Only callee-saved registers are meaningful here: everything else is
//! already clobbered by the time the interposed allocator entry returns.
//! The captured stack slice starts at the current stack pointer and runs
//! towards the thread's stack top, bounded by the sample stack size.

use std::arch::asm;
use std::mem;
use std::ptr;

use everprof_events::{sampled_reg_index, PERF_REGS_COUNT};

/// Top of the current thread's stack (the highest address), from
/// `pthread_getattr_np`. The result must be cached thread-locally by the
/// caller: `pthread_getattr_np` itself allocates, so calling it from inside
/// an interposed allocator deadlocks some mallocs.
pub fn query_stack_end() -> u64 {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return 0;
        }
        let mut stack_addr: *mut libc::c_void = ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return 0;
        }
        stack_addr as u64 + stack_size as u64
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub fn save_context(regs: &mut [u64; PERF_REGS_COUNT], stack_out: &mut [u8], stack_end: u64) -> u64 {
    let mut saved = [0u64; 8];
    // Scratch registers are pinned to caller-saved ones so none of the
    // registers being read can be clobbered by operand allocation.
    unsafe {
        asm!(
            "mov [rax], rbx",
            "mov [rax + 8], rbp",
            "mov [rax + 16], rsp",
            "mov [rax + 24], r12",
            "mov [rax + 32], r13",
            "mov [rax + 40], r14",
            "mov [rax + 48], r15",
            "lea rcx, [rip]",
            "mov [rax + 56], rcx",
            in("rax") saved.as_mut_ptr(),
            out("rcx") _,
            options(nostack, preserves_flags)
        );
    }

    regs.fill(0);
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_BX)] = saved[0];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_BP)] = saved[1];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_SP)] = saved[2];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_R12)] = saved[3];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_R13)] = saved[4];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_R14)] = saved[5];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_R15)] = saved[6];
    regs[sampled_reg_index(everprof_events::PERF_REG_X86_IP)] = saved[7];

    copy_stack(saved[2], stack_end, stack_out)
}

#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub fn save_context(regs: &mut [u64; PERF_REGS_COUNT], stack_out: &mut [u8], stack_end: u64) -> u64 {
    let mut saved = [0u64; 14];
    unsafe {
        asm!(
            "stp x19, x20, [x9]",
            "stp x21, x22, [x9, #16]",
            "stp x23, x24, [x9, #32]",
            "stp x25, x26, [x9, #48]",
            "stp x27, x28, [x9, #64]",
            "stp x29, x30, [x9, #80]",
            "mov x10, sp",
            "adr x11, .",
            "stp x10, x11, [x9, #96]",
            in("x9") saved.as_mut_ptr(),
            out("x10") _,
            out("x11") _,
            options(nostack, preserves_flags)
        );
    }

    regs.fill(0);
    for (i, value) in saved[..12].iter().enumerate() {
        regs[sampled_reg_index(everprof_events::PERF_REG_ARM64_X19 + i as u64)] = *value;
    }
    let sp = saved[12];
    regs[sampled_reg_index(everprof_events::PERF_REG_ARM64_SP)] = sp;
    regs[sampled_reg_index(everprof_events::PERF_REG_ARM64_PC)] = saved[13];

    copy_stack(sp, stack_end, stack_out)
}

/// Copy `[sp, min(stack_end, sp + out.len()))` into `out`; returns the
/// number of bytes captured.
fn copy_stack(sp: u64, stack_end: u64, out: &mut [u8]) -> u64 {
    if stack_end <= sp {
        return 0;
    }
    let len = ((stack_end - sp) as usize).min(out.len());
    unsafe {
        ptr::copy_nonoverlapping(sp as *const u8, out.as_mut_ptr(), len);
    }
    len as u64
}
