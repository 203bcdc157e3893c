// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Installation of the process-wide interception points: signal handlers for
//! the hardware/kernel fault categories and a chained panic hook for the
//! runtime ones.
//!
//! The signal trampoline below runs with the process in an arbitrary state.
//! It makes no heap allocation and takes no lock other than the crash
//! pipeline's own reentrancy lock; everything it needs was prepared at
//! install time.

use super::context::MachineContext;
use super::fault::{FaultDescriptor, FaultKind};
use crate::launcher::terminate;
use crate::shared::configuration::HookMask;
use libc::{
    c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ,
    PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
use std::collections::HashMap;
use std::panic::{self, PanicHookInfo};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Fault hooks are already installed")]
    AlreadyInstalled,
    #[error("Fault hooks are not installed")]
    NotInstalled,
    #[error("Errors registering signal handlers: {0:?}")]
    RegisterFailed(Vec<String>),
    #[error("Failed to set up the alternate signal stack: {0}")]
    AltStackFailed(String),
    #[error("Thread hooks already registered for this thread")]
    ThreadAlreadyRegistered,
    #[error("No thread hooks registered for this thread")]
    ThreadNotRegistered,
}

/// Install state of one interception point.  `Installed` carries what must
/// be restored at uninstall; an empty slot is explicit rather than a
/// sentinel value.
#[derive(Debug)]
pub enum HookSlot {
    NotInstalled,
    Installed(SigAction),
}

/// The signals implied by the mask bits that have a kernel-level
/// realization on this platform.  The remaining bits describe runtime
/// conditions (pure-call, invalid-parameter, ...) that arrive through other
/// paths and need no sigaction.
fn signals_for_mask(mask: HookMask) -> Vec<Signal> {
    let mut signals = Vec::new();
    if mask.contains(HookMask::STRUCTURED_EXCEPTION) {
        signals.push(Signal::SIGSEGV);
        signals.push(Signal::SIGBUS);
    }
    if mask.contains(HookMask::SIGABRT) {
        signals.push(Signal::SIGABRT);
    }
    if mask.contains(HookMask::SIGFPE) {
        signals.push(Signal::SIGFPE);
    }
    if mask.contains(HookMask::SIGILL) {
        signals.push(Signal::SIGILL);
    }
    if mask.contains(HookMask::SIGINT) {
        signals.push(Signal::SIGINT);
    }
    if mask.contains(HookMask::SIGSEGV) && !mask.contains(HookMask::STRUCTURED_EXCEPTION) {
        signals.push(Signal::SIGSEGV);
    }
    if mask.contains(HookMask::SIGTERM) {
        signals.push(Signal::SIGTERM);
    }
    signals
}

fn fault_kind_for_signal(signum: i32) -> FaultKind {
    match signum {
        libc::SIGABRT => FaultKind::SigAbrt,
        libc::SIGFPE => FaultKind::SigFpe,
        libc::SIGILL => FaultKind::SigIll,
        libc::SIGINT => FaultKind::SigInt,
        libc::SIGSEGV | libc::SIGBUS => FaultKind::SigSegv,
        libc::SIGTERM => FaultKind::SigTerm,
        _ => FaultKind::StructuredException,
    }
}

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync>;
// Always either null_mut or Box::into_raw; reconstituted with Box::from_raw
// at uninstall.
static PREVIOUS_PANIC_HOOK: AtomicPtr<PanicHook> = AtomicPtr::new(ptr::null_mut());

/// Tracks what was installed so uninstall can put everything back.
pub struct HookInstaller {
    installed: bool,
    signal_slots: Vec<(Signal, HookSlot)>,
    panic_hook_installed: bool,
}

impl HookInstaller {
    pub fn new() -> Self {
        HookInstaller {
            installed: false,
            signal_slots: Vec::new(),
            panic_hook_installed: false,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Installs every interception point the mask selects.  Individual
    /// sigaction failures are collected and reported together so one exotic
    /// signal does not silently disable the rest.
    pub fn install(&mut self, mask: HookMask, create_alt_stack: bool) -> Result<(), HookError> {
        if self.installed {
            return Err(HookError::AlreadyInstalled);
        }
        if create_alt_stack {
            // Safety: no documented preconditions.
            unsafe { install_alt_stack()? };
        }

        let mut errors = vec![];
        for sig in signals_for_mask(mask) {
            let sig_action = SigAction::new(
                SigHandler::SigAction(handle_signal),
                SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
                signal::SigSet::empty(),
            );
            // Safety: the trampoline is async-signal safe.
            match unsafe { signal::sigaction(sig, &sig_action) } {
                Ok(previous) => self.signal_slots.push((sig, HookSlot::Installed(previous))),
                Err(e) => errors.push(format!("Unable to register handler for {sig}: {e:?}")),
            }
        }

        let panic_bits = HookMask::TERMINATE_CALL
            | HookMask::UNEXPECTED_CALL
            | HookMask::ALLOC_FAILURE;
        if !HookMask(mask.0 & panic_bits.0).is_empty() {
            install_panic_hook();
            self.panic_hook_installed = true;
        }

        self.installed = true;
        if !errors.is_empty() {
            return Err(HookError::RegisterFailed(errors));
        }
        Ok(())
    }

    /// Restores every previous disposition recorded at install.
    pub fn uninstall(&mut self) -> Result<(), HookError> {
        if !self.installed {
            return Err(HookError::NotInstalled);
        }
        for (sig, slot) in self.signal_slots.drain(..) {
            if let HookSlot::Installed(previous) = slot {
                // Safety: `previous` came from the matching sigaction swap.
                let _ = unsafe { signal::sigaction(sig, &previous) };
            }
        }
        if self.panic_hook_installed {
            uninstall_panic_hook();
            self.panic_hook_installed = false;
        }
        self.installed = false;
        Ok(())
    }
}

impl Default for HookInstaller {
    fn default() -> Self {
        Self::new()
    }
}

fn install_panic_hook() {
    if !PREVIOUS_PANIC_HOOK.load(SeqCst).is_null() {
        return;
    }
    let old_hook = panic::take_hook();
    let old_hook_ptr = Box::into_raw(Box::new(old_hook));
    PREVIOUS_PANIC_HOOK.swap(old_hook_ptr, SeqCst);
    panic::set_hook(Box::new(|panic_info| {
        let resume = super::crash_handler::handle_panic(panic_info);
        call_previous_panic_hook(panic_info);
        if !resume {
            terminate();
        }
    }));
}

fn call_previous_panic_hook(panic_info: &PanicHookInfo<'_>) {
    let hook_ptr = PREVIOUS_PANIC_HOOK.load(SeqCst);
    if !hook_ptr.is_null() {
        // Safety: only ever set from Box::into_raw, and never freed while
        // non-null.
        let previous_hook = unsafe { &*hook_ptr };
        previous_hook(panic_info);
    }
}

fn uninstall_panic_hook() {
    let old_hook_ptr = PREVIOUS_PANIC_HOOK.swap(ptr::null_mut(), SeqCst);
    if !old_hook_ptr.is_null() {
        let _ = panic::take_hook();
        // Safety: came from Box::into_raw in install_panic_hook.
        let old_hook = unsafe { Box::from_raw(old_hook_ptr) };
        panic::set_hook(*old_hook);
    }
}

/// Allocates a signal altstack with a guard page at the low end and makes it
/// current for this thread.  The default SIGSTKSZ (8KB on many systems) is
/// not enough headroom for the crash pipeline, so the size floor is 16
/// pages.
unsafe fn install_alt_stack() -> Result<(), HookError> {
    let page_size = page_size::get();
    let sigaltstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        sigaltstack_base_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    if stackp == MAP_FAILED {
        return Err(HookError::AltStackFailed(
            "failed to allocate the stack mapping".into(),
        ));
    }
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    if guard_result != 0 {
        return Err(HookError::AltStackFailed(
            "failed to protect the guard page".into(),
        ));
    }
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigaltstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    if rval != 0 {
        return Err(HookError::AltStackFailed(format!(
            "sigaltstack failed {rval}"
        )));
    }
    Ok(())
}

/// A SIGSEGV whose faulting address sits within a few pages of the stack
/// pointer is a blown stack, not a stray pointer.
fn is_stack_overflow(signum: i32, ctx: &MachineContext) -> bool {
    if signum != libc::SIGSEGV || ctx.fault_addr == 0 || ctx.sp == 0 {
        return false;
    }
    let window = 32 * page_size::get() as u64;
    ctx.fault_addr.abs_diff(ctx.sp) <= window
}

/// The process-wide signal trampoline.  Runs on the alternate stack when one
/// was installed.
extern "C" fn handle_signal(signum: i32, sig_info: *mut siginfo_t, ucontext: *mut c_void) {
    // Safety: the kernel hands us valid pointers (or nulls, which are
    // tolerated).
    let ctx = unsafe { MachineContext::from_signal(sig_info, ucontext) };

    if is_stack_overflow(signum, &ctx) {
        // The faulting thread has no usable stack beyond the altstack.
        // Marshal the pipeline onto a fresh thread with a healthy stack and
        // never return: there is nothing to resume onto.
        let mut desc = FaultDescriptor::new(FaultKind::StackOverflow, ctx);
        desc.code = signum as u32;
        let worker = std::thread::Builder::new()
            .name("crash-pipeline".into())
            .spawn(move || {
                super::crash_handler::handle_fault(desc);
            });
        if let Ok(worker) = worker {
            let _ = worker.join();
        }
        terminate();
    }

    let mut desc = FaultDescriptor::new(fault_kind_for_signal(signum), ctx);
    desc.code = signum as u32;
    if signum == libc::SIGFPE && !sig_info.is_null() {
        // Safety: non-null siginfo from the kernel.
        desc.fpe_subcode = unsafe { (*sig_info).si_code } as u32;
    }

    if super::crash_handler::handle_fault(desc) {
        // The host elected to resume; returning re-executes the faulting
        // instruction (or simply continues, for raised signals).
        return;
    }
    terminate();
}

// Per-thread hook registry.  Signal dispositions are process-wide on this
// platform, so thread-scoped registration is bookkeeping: it validates the
// install/uninstall pairing per thread and keeps the process-wide hooks
// pinned while any thread registration remains.
static THREAD_HOOKS: OnceLock<Mutex<HashMap<ThreadId, HookMask>>> = OnceLock::new();

fn thread_hooks() -> &'static Mutex<HashMap<ThreadId, HookMask>> {
    THREAD_HOOKS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn install_per_thread(mask: HookMask) -> Result<(), HookError> {
    let mask = mask.or_all();
    #[allow(clippy::unwrap_used)]
    let mut map = thread_hooks().lock().unwrap();
    match map.entry(std::thread::current().id()) {
        std::collections::hash_map::Entry::Occupied(_) => Err(HookError::ThreadAlreadyRegistered),
        std::collections::hash_map::Entry::Vacant(slot) => {
            slot.insert(mask);
            Ok(())
        }
    }
}

pub(crate) fn uninstall_per_thread() -> Result<(), HookError> {
    #[allow(clippy::unwrap_used)]
    let mut map = thread_hooks().lock().unwrap();
    map.remove(&std::thread::current().id())
        .map(|_| ())
        .ok_or(HookError::ThreadNotRegistered)
}

pub(crate) fn per_thread_count() -> usize {
    #[allow(clippy::unwrap_used)]
    thread_hooks().lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_for_mask() {
        let sigs = signals_for_mask(HookMask::ALL);
        assert!(sigs.contains(&Signal::SIGSEGV));
        assert!(sigs.contains(&Signal::SIGBUS));
        assert!(sigs.contains(&Signal::SIGABRT));
        // SIGSEGV appears once even though two mask bits imply it.
        assert_eq!(sigs.iter().filter(|s| **s == Signal::SIGSEGV).count(), 1);

        let sigs = signals_for_mask(HookMask::SIGTERM);
        assert_eq!(sigs, vec![Signal::SIGTERM]);

        // Bits with no kernel realization produce no sigaction at all.
        assert!(signals_for_mask(HookMask::PURE_CALL).is_empty());
    }

    #[test]
    fn test_fault_kind_for_signal() {
        assert_eq!(fault_kind_for_signal(libc::SIGSEGV), FaultKind::SigSegv);
        assert_eq!(fault_kind_for_signal(libc::SIGBUS), FaultKind::SigSegv);
        assert_eq!(fault_kind_for_signal(libc::SIGABRT), FaultKind::SigAbrt);
    }

    #[test]
    fn test_stack_overflow_heuristic() {
        let near = MachineContext {
            ip: 0x1000,
            sp: 0x7fff_f000,
            fault_addr: 0x7fff_e000,
        };
        assert!(is_stack_overflow(libc::SIGSEGV, &near));
        // Same addresses but a different signal: not a stack overflow.
        assert!(!is_stack_overflow(libc::SIGBUS, &near));

        let far = MachineContext {
            ip: 0x1000,
            sp: 0x7fff_f000,
            fault_addr: 0x10,
        };
        assert!(!is_stack_overflow(libc::SIGSEGV, &far));
        // Null dereference with no recorded sp.
        let empty = MachineContext::default();
        assert!(!is_stack_overflow(libc::SIGSEGV, &empty));
    }

    #[test]
    fn test_per_thread_registry_contract() {
        std::thread::spawn(|| {
            assert!(install_per_thread(HookMask::ALL).is_ok());
            assert!(matches!(
                install_per_thread(HookMask::SIGABRT),
                Err(HookError::ThreadAlreadyRegistered)
            ));
            assert!(uninstall_per_thread().is_ok());
            assert!(matches!(
                uninstall_per_thread(),
                Err(HookError::ThreadNotRegistered)
            ));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_uninstall_without_install_fails() {
        let mut installer = HookInstaller::new();
        assert!(matches!(
            installer.uninstall(),
            Err(HookError::NotInstalled)
        ));
    }
}
