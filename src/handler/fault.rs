// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::context::MachineContext;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;

/// The category of an intercepted fault.  The discriminants are stable: they
/// cross the process boundary inside the transfer record and appear in the
/// reporter's output.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, FromPrimitive, ToPrimitive,
)]
#[repr(i32)]
pub enum FaultKind {
    /// Hardware-level fault (bad memory access, privileged instruction).
    StructuredException = 0,
    /// The runtime's abnormal-termination path; on this platform, an
    /// unhandled panic.
    TerminateCall = 1,
    UnexpectedCall = 2,
    PureCall = 3,
    /// Allocation failure reported by the global allocator.
    AllocFailure = 4,
    /// Stack-buffer overrun detected by runtime instrumentation.
    Security = 5,
    /// Invalid argument detected by a runtime check.
    InvalidParameter = 6,
    SigAbrt = 7,
    SigFpe = 8,
    SigIll = 9,
    SigInt = 10,
    SigSegv = 11,
    SigTerm = 12,
    NonContinuable = 13,
    /// A panic carrying a non-string payload.
    TypedThrow = 14,
    StackOverflow = 15,
    /// Report requested by the host application without any fault.
    Manual = 16,
}

impl FaultKind {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// A failed-assertion site, when an assertion is what brought the process
/// down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssertionInfo {
    pub expression: String,
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// Everything known about one fault at the moment it is handled.
#[derive(Debug, Clone)]
pub struct FaultDescriptor {
    pub kind: FaultKind,
    /// Raw signal number or category-specific code.
    pub code: u32,
    /// Floating-point sub-cause (`FPE_INTDIV` and friends), when known.
    pub fpe_subcode: u32,
    pub assertion: Option<AssertionInfo>,
    pub context: MachineContext,
    /// True when the host requested the report rather than a hook firing.
    pub manual: bool,
    /// Human-readable cause, e.g. a panic message.
    pub message: Option<String>,
    /// Filled in once the reporter process has been spawned.
    pub reporter_pid: Option<i32>,
}

impl FaultDescriptor {
    pub fn new(kind: FaultKind, context: MachineContext) -> Self {
        FaultDescriptor {
            kind,
            code: 0,
            fpe_subcode: 0,
            assertion: None,
            context,
            manual: false,
            message: None,
            reporter_pid: None,
        }
    }

    pub fn manual(context: MachineContext) -> Self {
        let mut desc = Self::new(FaultKind::Manual, context);
        desc.manual = true;
        desc
    }
}

/// Where in the pipeline the callback is being invoked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallbackStage {
    /// The record is packed but the reporter has not been launched yet; the
    /// last chance to veto or amend the report.
    Prepare,
    /// The reporter has signalled completion (or the launch failed).
    Finish,
}

/// What the callback wants the pipeline to do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CallbackAction {
    /// Abandon the report at the Prepare stage.
    Cancel,
    /// Proceed, and do not call the callback again this cycle.
    DoDefault,
    /// Proceed, and call the callback again at the next stage.
    #[default]
    NotifyNextStage,
}

/// The view of the in-flight report handed to the host callback.
pub struct CallbackInfo<'a> {
    pub stage: CallbackStage,
    pub fault: &'a FaultDescriptor,
    /// Set to true to let the faulting thread resume instead of terminating.
    /// Reset before each new fault.
    pub continue_execution: &'a mut bool,
}

pub type CrashCallback = Box<dyn FnMut(&mut CallbackInfo) -> CallbackAction + Send>;

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_fault_kind_discriminants_are_stable() {
        assert_eq!(FaultKind::StructuredException.as_i32(), 0);
        assert_eq!(FaultKind::SigSegv.as_i32(), 11);
        assert_eq!(FaultKind::Manual.as_i32(), 16);
        assert_eq!(FaultKind::from_i32(15), Some(FaultKind::StackOverflow));
        assert_eq!(FaultKind::from_i32(17), None);
    }
}
