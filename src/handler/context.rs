// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

/// The minimal machine state captured at the fault site: enough for the
/// reporter to anchor a stack walk without the faulting process doing any
/// unwinding itself.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MachineContext {
    pub ip: u64,
    pub sp: u64,
    /// The address whose access faulted, when the kernel reports one.
    pub fault_addr: u64,
}

impl MachineContext {
    /// Captures the caller's approximate ip/sp.  Used for manual reports and
    /// runtime-detected faults that arrive without a signal context.
    pub fn capture_current() -> Self {
        let mut ctx = MachineContext::default();
        let mut depth = 0usize;
        // SAFETY: called from a single thread on its own stack; the
        // unsynchronized variant is also usable from a signal handler.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                depth += 1;
                if depth == 2 {
                    ctx.ip = frame.ip() as u64;
                    ctx.sp = frame.sp() as u64;
                    false
                } else {
                    true
                }
            });
        }
        ctx
    }

    /// Extracts ip/sp from the ucontext passed to a signal handler, plus the
    /// faulting address from siginfo.
    ///
    /// # Safety
    /// `ucontext` and `info` must be the pointers the kernel handed to the
    /// signal handler.
    pub unsafe fn from_signal(info: *const libc::siginfo_t, ucontext: *const libc::c_void) -> Self {
        let mut ctx = MachineContext::default();
        if !info.is_null() {
            #[cfg(target_os = "linux")]
            {
                ctx.fault_addr = (*info).si_addr() as u64;
            }
            #[cfg(target_os = "macos")]
            {
                ctx.fault_addr = (*info).si_addr as u64;
            }
        }
        if ucontext.is_null() {
            return ctx;
        }

        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            let uc = &*(ucontext as *const libc::ucontext_t);
            ctx.ip = uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64;
            ctx.sp = uc.uc_mcontext.gregs[libc::REG_RSP as usize] as u64;
        }
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        {
            let uc = &*(ucontext as *const libc::ucontext_t);
            ctx.ip = uc.uc_mcontext.pc;
            ctx.sp = uc.uc_mcontext.sp;
        }
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        {
            let uc = &*(ucontext as *const libc::ucontext_t);
            ctx.ip = (*uc.uc_mcontext).__ss.__rip;
            ctx.sp = (*uc.uc_mcontext).__ss.__rsp;
        }
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            let uc = &*(ucontext as *const libc::ucontext_t);
            ctx.ip = (*uc.uc_mcontext).__ss.__pc;
            ctx.sp = (*uc.uc_mcontext).__ss.__sp;
        }
        ctx
    }
}
