// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault interception and the single crash pipeline.
//!
//! `hooks` installs the process-wide interception points and funnels every
//! fault into `crash_handler`, which serializes crash handling behind one
//! lock and drives the record/reporter handoff.

mod context;
mod crash_handler;
mod fault;
mod hooks;
pub(crate) mod last_error;

pub use context::MachineContext;
pub use crash_handler::{install, is_installed, uninstall, CrashError, CrashHandler, InstallGuard};
pub use fault::{
    AssertionInfo, CallbackAction, CallbackInfo, CallbackStage, CrashCallback, FaultDescriptor,
    FaultKind,
};
pub use hooks::{HookError, HookSlot};
pub(crate) use crash_handler::{raise_synthetic_fault, with_installed};
pub(crate) use hooks::{install_per_thread, uninstall_per_thread};
