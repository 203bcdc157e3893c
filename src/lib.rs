// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash reporting with an out-of-process reporter.
//!
//! The host installs a process-wide handler once; from then on every
//! intercepted fault runs a single serialized pipeline: stamp the fault into
//! a pre-packed shared-memory record, give the host callback a chance to
//! veto, spawn the reporter binary, and wait (bounded) for it to collect
//! everything it needs from the still-alive process.  The faulting process
//! never touches its own heap state to describe the crash: the record is
//! offset-based and fully prepared before any fault occurs.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! let config = crashtrap::CrashConfiguration::with_defaults("my-app", "1.0.0")?;
//! crashtrap::install(config)?;
//! crashtrap::add_property("channel", "beta")?;
//! // ... run the application ...
//! crashtrap::uninstall()?;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod launcher;
pub mod reporter;
pub mod shared;
pub mod test_crash;
pub mod transfer;

pub use handler::{
    AssertionInfo, CallbackAction, CallbackInfo, CallbackStage, CrashCallback, CrashError,
    FaultDescriptor, FaultKind, InstallGuard, MachineContext,
};
pub use shared::configuration::{CrashConfiguration, DumpVerbosity, HookMask};
pub use transfer::FileFlags;

use handler::last_error;
use std::path::Path;

fn entry<T>(f: impl FnOnce() -> Result<T, CrashError>) -> Result<T, CrashError> {
    // Each public entry point resets the per-thread error report; see
    // `last_error_message`.
    last_error::clear();
    let result = f();
    if let Err(e) = &result {
        last_error::push(e.to_string());
    }
    result
}

/// Installs the process-wide crash handler.
pub fn install(config: CrashConfiguration) -> Result<(), CrashError> {
    entry(|| handler::install(config))
}

/// Uninstalls the process-wide crash handler and restores every previous
/// fault disposition.  Fails while any thread still holds a per-thread
/// registration.
pub fn uninstall() -> Result<(), CrashError> {
    entry(handler::uninstall)
}

pub fn is_installed() -> bool {
    handler::is_installed()
}

/// Registers per-thread fault hooks for the calling thread.  Must be paired
/// with [`uninstall_per_thread_hooks`] on the same thread before the
/// process-wide handler can be uninstalled.
pub fn install_per_thread_hooks(mask: HookMask) -> Result<(), CrashError> {
    entry(|| {
        handler::with_installed(|_| Ok(()))?;
        handler::install_per_thread(mask).map_err(CrashError::from)
    })
}

/// Removes the calling thread's per-thread hook registration.
pub fn uninstall_per_thread_hooks() -> Result<(), CrashError> {
    entry(|| {
        handler::with_installed(|_| Ok(()))?;
        handler::uninstall_per_thread().map_err(CrashError::from)
    })
}

/// Attaches a file (or a `*`/`?` search pattern) to every future report.
/// `dst_name` defaults to the final path component.
pub fn add_file(
    src_path: impl AsRef<Path>,
    dst_name: Option<&str>,
    description: &str,
    flags: FileFlags,
) -> Result<(), CrashError> {
    entry(|| {
        handler::with_installed(|h| h.add_file(src_path.as_ref(), dst_name, description, flags))
    })
}

/// Attaches a named property to every future report.  Re-adding a name
/// overwrites its value.
pub fn add_property(name: &str, value: &str) -> Result<(), CrashError> {
    entry(|| handler::with_installed(|h| h.add_property(name, value)))
}

/// Sets the host callback invoked at the Prepare and Finish stages of each
/// report.  The last callback set wins.
pub fn set_crash_callback(callback: CrashCallback) -> Result<(), CrashError> {
    entry(|| {
        handler::with_installed(|h| {
            h.set_crash_callback(callback);
            Ok(())
        })
    })
}

/// Generates a report right now, without any fault.  The process continues
/// afterwards.
pub fn generate_error_report() -> Result<(), CrashError> {
    entry(|| handler::with_installed(|h| h.generate_error_report(None)))
}

/// Generates a report for a fault the host intercepted itself.
pub fn report_fault(fault: FaultDescriptor) -> Result<(), CrashError> {
    entry(|| handler::with_installed(|h| h.generate_error_report(Some(fault))))
}

/// Raises a deliberate fault of the given category on the calling thread.
pub use test_crash::{emulate_crash, emulate_crash_code};

/// The error lines accumulated by the most recent call on this thread,
/// newline-joined.  Empty when the last call succeeded without notes.
pub fn last_error_message() -> String {
    last_error::message()
}
