// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deliberate fault generation, for verifying an installed handler end to
//! end.  Each category produces the most genuine fault available on this
//! platform; categories that describe runtime checks with no platform
//! realization are injected directly into the pipeline instead.

use crate::handler::{raise_synthetic_fault, FaultKind};
use crate::launcher::terminate;
use std::hint::black_box;

/// Raises the fault category on the calling thread.  For most categories
/// this function does not return: either the fault brings the process down
/// through the installed hooks, or (if the host callback elected to
/// continue) the injected categories return normally.
pub fn emulate_crash(kind: FaultKind) {
    match kind {
        FaultKind::StructuredException | FaultKind::SigSegv => {
            // A genuine access violation, so the kernel-level path is what
            // gets exercised.
            unsafe {
                let p: *mut u32 = std::ptr::null_mut();
                std::ptr::write_volatile(black_box(p), 0xDEAD);
            }
        }
        FaultKind::TerminateCall | FaultKind::UnexpectedCall => {
            panic!("emulated abnormal termination");
        }
        FaultKind::TypedThrow => {
            // A non-string payload takes the typed-throw path in the hook.
            std::panic::panic_any(13i32);
        }
        FaultKind::AllocFailure => {
            std::alloc::handle_alloc_error(std::alloc::Layout::new::<[u8; 1024]>());
        }
        FaultKind::SigAbrt => unsafe {
            libc::abort();
        },
        FaultKind::SigFpe => unsafe {
            libc::raise(libc::SIGFPE);
        },
        FaultKind::SigIll => unsafe {
            libc::raise(libc::SIGILL);
        },
        FaultKind::SigInt => unsafe {
            libc::raise(libc::SIGINT);
        },
        FaultKind::SigTerm => unsafe {
            libc::raise(libc::SIGTERM);
        },
        FaultKind::StackOverflow => {
            recurse_forever(0);
        }
        FaultKind::PureCall
        | FaultKind::Security
        | FaultKind::InvalidParameter
        | FaultKind::NonContinuable => {
            // No kernel or runtime realization here; route straight into
            // the pipeline as if the matching hook had fired.
            if !raise_synthetic_fault(kind, None) {
                terminate();
            }
        }
        FaultKind::Manual => {
            let _ = crate::generate_error_report();
        }
    }
}

/// Raw-code variant of [`emulate_crash`] for hosts driving the injector
/// across an FFI boundary.  A code that maps to no category is a no-op.
pub fn emulate_crash_code(code: i32) {
    if let Some(kind) = <FaultKind as num_traits::FromPrimitive>::from_i32(code) {
        emulate_crash(kind);
    }
}

#[inline(never)]
fn recurse_forever(depth: u64) -> u64 {
    // The array keeps each frame large enough that the guard page is hit
    // quickly; black_box defeats tail-call collapse.
    let filler = [depth; 256];
    black_box(recurse_forever(depth + 1) + black_box(filler)[0])
}
