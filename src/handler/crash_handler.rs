// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! The singleton crash handler and the at-most-once crash pipeline.
//!
//! The handler is reachable from signal context, so it lives behind an
//! `AtomicPtr` rather than a mutex: always either null or `Box::into_raw`.
//! If the process crashes while a report is in flight, the box is simply
//! leaked; a crashed process has no use for its heap.
//!
//! Host callbacks run with the internal state lock released, so a prepare
//! stage callback may still call `add_file`/`add_property` to amend the
//! report that is about to ship.

use super::fault::{
    AssertionInfo, CallbackAction, CallbackInfo, CallbackStage, CrashCallback, FaultDescriptor,
    FaultKind,
};
use super::hooks::{self, HookError, HookInstaller};
use super::last_error;
use crate::launcher::{
    launch_reporter, terminate, LaunchError, PreparedLaunch, SyncFifo,
};
use crate::shared::configuration::{CrashConfiguration, HookMask};
use crate::shared::constants::sync_fifo_path;
use crate::transfer::{
    AssertionRecord, FaultSummary, FileFlags, RecordSeed, RegisteredFile, TransferError,
    TransferWriter,
};
use crate::handler::MachineContext;
use nix::sys::signal::{self, SigHandler, Signal};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicPtr, AtomicU64};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

// Always either null_mut or Box::into_raw; see module docs.
static HANDLER: AtomicPtr<CrashHandler> = AtomicPtr::new(ptr::null_mut());

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("A crash handler is already installed in this process")]
    AlreadyInstalled,
    #[error("No crash handler is installed in this process")]
    NotInstalled,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Report cancelled by the host callback")]
    Cancelled,
    #[error("The crash pipeline is already running on this thread")]
    Reentrant,
    #[error("A file is already registered under the destination name {0:?}")]
    DuplicateDestination(String),
    #[error("Invalid path: {0:?}")]
    InvalidPath(PathBuf),
    #[error("Property names cannot be empty")]
    InvalidPropertyName,
    #[error("Registered file does not exist: {0:?}")]
    MissingFile(PathBuf),
    #[error("{0} thread(s) still hold per-thread hook registrations")]
    PerThreadHandlersRemain(usize),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn current_thread_token() -> u64 {
    #[cfg(target_os = "linux")]
    // Safety: no preconditions.
    let tid = unsafe { libc::gettid() } as u64;
    #[cfg(not(target_os = "linux"))]
    // Safety: no preconditions.
    let tid = unsafe { libc::pthread_self() } as u64;
    tid
}

/// A mutex that can tell when the thread asking for it is the thread holding
/// it.  A plain mutex would deadlock a same-thread reentrant fault (the
/// pipeline itself crashing); this one detects it so the caller can
/// terminate instead.  Faults on other threads block and are handled one at
/// a time, each seeing a freshly reinitialized record.
struct ReentrancyLock {
    // Kernel thread id of the holder; 0 when free.
    owner: AtomicU64,
    lock: Mutex<()>,
}

struct ReentrancyGuard<'a> {
    owner: &'a AtomicU64,
    _inner: MutexGuard<'a, ()>,
}

impl ReentrancyLock {
    fn new() -> Self {
        ReentrancyLock {
            owner: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    fn acquire(&self) -> Result<ReentrancyGuard<'_>, CrashError> {
        let token = current_thread_token();
        if self.owner.load(SeqCst) == token {
            return Err(CrashError::Reentrant);
        }
        // A poisoned lock means a previous pipeline panicked; the state it
        // protects is re-seeded on every cycle, so keep going.
        let inner = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(token, SeqCst);
        Ok(ReentrancyGuard {
            owner: &self.owner,
            _inner: inner,
        })
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(0, SeqCst);
    }
}

/// Everything that changes between crash cycles, behind one lock.
struct ReportState {
    // Keyed by destination name; BTreeMap keeps packing order stable.
    files: BTreeMap<String, RegisteredFile>,
    properties: BTreeMap<String, String>,
    callback: Option<CrashCallback>,
    callback_ret: CallbackAction,
    crash_id: String,
    writer: Option<TransferWriter>,
    sync_fifo: Option<SyncFifo>,
    launch: Option<PreparedLaunch>,
    reporter_pid: Option<i32>,
    continue_execution: bool,
    continue_execution_now: bool,
}

pub struct CrashHandler {
    config: CrashConfiguration,
    image_path: PathBuf,
    output_dir: PathBuf,
    logs_dir: PathBuf,
    report_lock: ReentrancyLock,
    state: Mutex<ReportState>,
    hooks: Mutex<HookInstaller>,
}

impl CrashHandler {
    fn new(mut config: CrashConfiguration) -> Result<Self, CrashError> {
        let image_path = std::env::current_exe()?;
        let image_dir = image_path
            .parent()
            .ok_or_else(|| CrashError::InvalidPath(image_path.clone()))?
            .to_path_buf();

        if config.app_name().is_empty() {
            let stem = image_path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| CrashError::InvalidPath(image_path.clone()))?;
            config.set_app_name(stem.to_string());
        }
        let reporter_path = match config.reporter_path() {
            Some(path) => path.clone(),
            None => {
                let derived = image_dir.join("crashtrap-reporter");
                config.set_reporter_path(derived.clone());
                derived
            }
        };
        if !reporter_path.is_file() {
            return Err(CrashError::InvalidConfiguration(format!(
                "reporter binary not found at {reporter_path:?}"
            )));
        }
        if let Some(helper) = config.symbol_helper_path() {
            if !helper.is_file() {
                return Err(CrashError::InvalidConfiguration(format!(
                    "symbol helper not found at {helper:?}"
                )));
            }
        }
        let output_dir = match config.output_dir() {
            Some(dir) => dir.clone(),
            None => {
                let derived = image_dir.join("dump");
                config.set_output_dir(derived.clone());
                derived
            }
        };
        let logs_dir = output_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;

        let handler = CrashHandler {
            config,
            image_path,
            output_dir,
            logs_dir,
            report_lock: ReentrancyLock::new(),
            state: Mutex::new(ReportState {
                files: BTreeMap::new(),
                properties: BTreeMap::new(),
                callback: None,
                callback_ret: CallbackAction::NotifyNextStage,
                crash_id: String::new(),
                writer: None,
                sync_fifo: None,
                launch: None,
                reporter_pid: None,
                continue_execution: false,
                continue_execution_now: false,
            }),
            hooks: Mutex::new(HookInstaller::new()),
        };
        {
            let mut state = handler.lock_state();
            handler.reinit(&mut state)?;
        }
        Ok(handler)
    }

    fn lock_state(&self) -> MutexGuard<'_, ReportState> {
        // State is re-seeded every cycle; a poisoned lock is survivable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CrashConfiguration {
        &self.config
    }

    /// Prepares the next crash cycle: fresh crash id, fresh fifo, fresh
    /// shared buffer with the registries re-packed, fresh prepared launch.
    /// Continue-execution flags rotate: the cycle that just finished reads
    /// the decision made while it ran; the next cycle starts at the neutral
    /// default (true, until a real fault forces it down).
    fn reinit(&self, state: &mut ReportState) -> Result<(), CrashError> {
        state.continue_execution_now = state.continue_execution;
        state.continue_execution = true;
        state.callback_ret = CallbackAction::NotifyNextStage;
        state.reporter_pid = None;
        // Drop the old buffer before creating the new one; the shm names
        // differ, but the old fifo path must be released first on reuse.
        state.writer = None;
        state.sync_fifo = None;
        state.launch = None;

        let crash_id = uuid::Uuid::new_v4().to_string();
        let fifo = SyncFifo::create(&sync_fifo_path(&self.logs_dir, &crash_id))?;
        let seed = RecordSeed {
            crash_id: crash_id.clone(),
            app_name: self.config.app_name().to_string(),
            app_version: self.config.app_version().to_string(),
            image_path: self.image_path.to_string_lossy().into_owned(),
            output_dir: self.output_dir.to_string_lossy().into_owned(),
            server_url: self.config.server_url().cloned(),
            symbol_helper_path: self
                .config
                .symbol_helper_path()
                .map(|p| p.to_string_lossy().into_owned()),
            dump_verbosity: self.config.dump_verbosity(),
            process_id: std::process::id(),
        };
        let mut writer = TransferWriter::begin(&seed)?;
        for file in state.files.values() {
            writer.pack_file_item(file)?;
        }
        for (name, value) in &state.properties {
            writer.pack_property(name, value)?;
        }
        #[allow(clippy::expect_used)]
        let reporter_path = self
            .config
            .reporter_path()
            .expect("reporter path resolved at construction");
        let launch = PreparedLaunch::new(reporter_path, &crash_id, fifo.path())?;

        state.crash_id = crash_id;
        state.writer = Some(writer);
        state.sync_fifo = Some(fifo);
        state.launch = Some(launch);
        Ok(())
    }

    pub fn add_file(
        &self,
        src_path: &Path,
        dst_name: Option<&str>,
        description: &str,
        flags: FileFlags,
    ) -> Result<(), CrashError> {
        if src_path.as_os_str().is_empty() {
            return Err(CrashError::InvalidPath(src_path.to_path_buf()));
        }
        let final_component = src_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CrashError::InvalidPath(src_path.to_path_buf()))?;
        let dst_name = dst_name.unwrap_or(final_component).to_string();

        // Search patterns are stored verbatim and expanded by the reporter
        // at collection time, so existence is only checked for plain paths.
        let is_pattern = final_component.contains(['*', '?']);
        if !is_pattern && !flags.contains(FileFlags::MISSING_FILE_OK) && !src_path.exists() {
            return Err(CrashError::MissingFile(src_path.to_path_buf()));
        }

        let mut state = self.lock_state();
        if state.files.contains_key(&dst_name) {
            return Err(CrashError::DuplicateDestination(dst_name));
        }
        let file = RegisteredFile {
            src_path: src_path.to_path_buf(),
            dst_name: dst_name.clone(),
            description: description.to_string(),
            flags,
        };
        if let Some(writer) = state.writer.as_mut() {
            writer.pack_file_item(&file)?;
        }
        state.files.insert(dst_name, file);
        Ok(())
    }

    pub fn add_property(&self, name: &str, value: &str) -> Result<(), CrashError> {
        if name.trim().is_empty() {
            return Err(CrashError::InvalidPropertyName);
        }
        let mut state = self.lock_state();
        // Overwrites append a fresh block; the reader keeps the last one.
        if let Some(writer) = state.writer.as_mut() {
            writer.pack_property(name, value)?;
        }
        state.properties.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_crash_callback(&self, callback: CrashCallback) {
        self.lock_state().callback = Some(callback);
    }

    /// Generates a report outside of any fault.  Serialized against crashes
    /// through the same lock; the process continues afterwards regardless of
    /// the callback's continue-execution decision.
    pub fn generate_error_report(
        &self,
        fault: Option<FaultDescriptor>,
    ) -> Result<(), CrashError> {
        let _guard = self.report_lock.acquire()?;
        let desc =
            fault.unwrap_or_else(|| FaultDescriptor::manual(MachineContext::capture_current()));
        let reinit_failure = Cell::new(None);
        let result = {
            let _reinit = ReinitGuard {
                handler: self,
                failure: &reinit_failure,
            };
            self.generate_inner(desc)
        };
        match (result, reinit_failure.take()) {
            (Ok(()), Some(e)) => Err(e),
            (result, _) => result,
        }
    }

    /// The pipeline body.  Caller holds the reentrancy lock.  The state lock
    /// is taken in short scopes so the host callback can run without it.
    fn generate_inner(&self, mut desc: FaultDescriptor) -> Result<(), CrashError> {
        {
            let mut state = self.lock_state();

            // Every trapped fault is fatal unless the callback explicitly
            // asks to continue; manual reports leave the neutral default
            // alone.
            if !desc.manual {
                state.continue_execution = false;
            }

            let writer = state.writer.as_mut().ok_or(CrashError::NotInstalled)?;
            writer.mark_crashed();
            writer.set_fault(&FaultSummary {
                kind: desc.kind.as_i32(),
                code: desc.code,
                fpe_subcode: desc.fpe_subcode,
                thread_id: current_thread_token(),
                ip: desc.context.ip,
                sp: desc.context.sp,
                fault_addr: desc.context.fault_addr,
                manual: desc.manual,
                assertion: desc.assertion.as_ref().map(|a| AssertionRecord {
                    expression: a.expression.clone(),
                    function: a.function.clone(),
                    file: a.file.clone(),
                    line: a.line,
                }),
            })?;
            if let Some(message) = &desc.message {
                writer.pack_property("panic.message", message)?;
            }
        }

        if self.notify_callback(CallbackStage::Prepare, &desc) == CallbackAction::Cancel {
            return Err(CrashError::Cancelled);
        }

        let launch_result = {
            let state = self.lock_state();
            let launch = state.launch.as_ref().ok_or(CrashError::NotInstalled)?;
            let fifo = state.sync_fifo.as_ref().ok_or(CrashError::NotInstalled)?;
            launch_reporter(launch, fifo, self.config.reporter_timeout())
        };
        let launch_failure = match launch_result {
            Ok(result) => {
                self.lock_state().reporter_pid = Some(result.pid);
                desc.reporter_pid = Some(result.pid);
                if !result.synced {
                    last_error::push(format!(
                        "reporter (pid {}) did not signal completion within {:?}",
                        result.pid,
                        self.config.reporter_timeout()
                    ));
                }
                None
            }
            Err(e) => {
                last_error::push(format!("failed to launch the reporter: {e}"));
                if !self.config.silent() {
                    eprintln!("crashtrap: failed to launch the crash reporter: {e}");
                }
                Some(e)
            }
        };

        // The finish stage runs whether or not the reporter launched; only a
        // prepare-stage cancellation skips it.
        self.notify_callback(CallbackStage::Finish, &desc);
        match launch_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Runs the host callback with the state lock released, so the callback
    /// may call back into `add_file`/`add_property`.  The callback slot is
    /// taken for the duration; `set_crash_callback` from inside the callback
    /// wins over the old one (last writer wins).
    fn notify_callback(&self, stage: CallbackStage, fault: &FaultDescriptor) -> CallbackAction {
        let (mut callback, mut continue_execution) = {
            let mut state = self.lock_state();
            if stage == CallbackStage::Finish && state.callback_ret == CallbackAction::DoDefault {
                return CallbackAction::DoDefault;
            }
            let Some(callback) = state.callback.take() else {
                return CallbackAction::NotifyNextStage;
            };
            (callback, state.continue_execution)
        };
        let mut info = CallbackInfo {
            stage,
            fault,
            continue_execution: &mut continue_execution,
        };
        let action = callback(&mut info);
        let mut state = self.lock_state();
        if state.callback.is_none() {
            state.callback = Some(callback);
        }
        state.continue_execution = continue_execution;
        if stage == CallbackStage::Prepare {
            state.callback_ret = action;
        }
        action
    }

    /// Entry point for fault trampolines.  Returns true when the host
    /// elected to resume execution.  A fault on the thread already running
    /// the pipeline is unrecoverable and terminates immediately.
    fn handle_fault(&self, desc: FaultDescriptor) -> bool {
        let guard = match self.report_lock.acquire() {
            Ok(guard) => guard,
            Err(_) => terminate(),
        };
        let reinit_failure = Cell::new(None);
        {
            let _reinit = ReinitGuard {
                handler: self,
                failure: &reinit_failure,
            };
            let _ = self.generate_inner(desc);
        }
        let continue_now = self.lock_state().continue_execution_now;
        drop(guard);
        continue_now
    }
}

/// Performs the per-crash reinitialization on drop, so the next cycle starts
/// clean even when the pipeline (or a host callback inside it) panics and
/// unwinds.  A reinitialization failure is pushed to the thread-local error
/// report and handed back through `failure`.
struct ReinitGuard<'a> {
    handler: &'a CrashHandler,
    failure: &'a Cell<Option<CrashError>>,
}

impl Drop for ReinitGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.handler.lock_state();
        if let Err(e) = self.handler.reinit(&mut state) {
            last_error::push(format!("failed to prepare the next crash cycle: {e}"));
            self.failure.set(Some(e));
        }
    }
}

/// Installs the handler singleton and every hook the configuration selects.
pub fn install(config: CrashConfiguration) -> Result<(), CrashError> {
    if !HANDLER.load(SeqCst).is_null() {
        return Err(CrashError::AlreadyInstalled);
    }
    let handler = Box::new(CrashHandler::new(config)?);
    {
        let mut hooks = handler
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = hooks.install(handler.config.hooks(), handler.config.create_alt_stack()) {
            // Some dispositions may have been swapped before the failure.
            let _ = hooks.uninstall();
            return Err(e.into());
        }
    }
    // A reporter or host pipe closing mid-write must not kill the process
    // with SIGPIPE before the pipeline can run.  Best effort: a host that
    // installed its own SIGPIPE disposition keeps it.
    if let Ok(current) = unsafe { signal::sigaction(Signal::SIGPIPE, &default_sigpipe_action()) } {
        if current.handler() != SigHandler::SigDfl {
            // Safety: restoring the action we just read.
            let _ = unsafe { signal::sigaction(Signal::SIGPIPE, &current) };
        }
    }

    let old = HANDLER.swap(Box::into_raw(handler), SeqCst);
    if !old.is_null() {
        // Lost an install race; put the other handler back and report.
        let ours = HANDLER.swap(old, SeqCst);
        // Safety: `ours` is the pointer we just created above.
        let ours = unsafe { Box::from_raw(ours) };
        let _ = ours
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .uninstall();
        return Err(CrashError::AlreadyInstalled);
    }
    Ok(())
}

fn default_sigpipe_action() -> signal::SigAction {
    signal::SigAction::new(
        SigHandler::SigIgn,
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    )
}

/// Removes the handler and restores every previous disposition.  Refused
/// while any thread still holds a per-thread registration.
pub fn uninstall() -> Result<(), CrashError> {
    let ptr = HANDLER.swap(ptr::null_mut(), SeqCst);
    if ptr.is_null() {
        return Err(CrashError::NotInstalled);
    }
    let remaining = hooks::per_thread_count();
    if remaining != 0 {
        HANDLER.store(ptr, SeqCst);
        return Err(CrashError::PerThreadHandlersRemain(remaining));
    }
    // Safety: non-null values only come from Box::into_raw in install().
    let handler = unsafe { Box::from_raw(ptr) };
    handler
        .hooks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .uninstall()?;
    Ok(())
}

pub fn is_installed() -> bool {
    !HANDLER.load(SeqCst).is_null()
}

pub(crate) fn with_installed<T>(
    f: impl FnOnce(&CrashHandler) -> Result<T, CrashError>,
) -> Result<T, CrashError> {
    let ptr = HANDLER.load(SeqCst);
    if ptr.is_null() {
        return Err(CrashError::NotInstalled);
    }
    // Safety: non-null values only come from Box::into_raw in install(), and
    // uninstall() has no way to know when in-flight readers finish, so the
    // box is freed only from uninstall on the assumption that hosts
    // uninstall after quiescing their own threads.
    f(unsafe { &*ptr })
}

/// Trampoline target: routes one fault descriptor into the pipeline.
/// Returns true when execution should resume.
pub(crate) fn handle_fault(desc: FaultDescriptor) -> bool {
    let ptr = HANDLER.load(SeqCst);
    if ptr.is_null() {
        return false;
    }
    // Safety: see with_installed.
    unsafe { &*ptr }.handle_fault(desc)
}

/// Panic hook target.  Returns true when the panic machinery should be
/// allowed to continue (handler missing, or the host elected to resume).
pub(crate) fn handle_panic(panic_info: &PanicHookInfo<'_>) -> bool {
    let ptr = HANDLER.load(SeqCst);
    if ptr.is_null() {
        return true;
    }
    let message = panic_info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
    // A payload that is not a string is a typed throw; describe it by its
    // origin instead.
    let kind = if message.is_some() {
        FaultKind::TerminateCall
    } else {
        FaultKind::TypedThrow
    };
    let mut desc = FaultDescriptor::new(kind, MachineContext::capture_current());
    desc.message = message.or_else(|| {
        panic_info
            .location()
            .map(|location| format!("panicked at {location}"))
    });
    // Safety: see with_installed.
    unsafe { &*ptr }.handle_fault(desc)
}

/// Routes a runtime-detected fault (no signal involved) into the pipeline,
/// as if the matching hook had fired.  Returns true when execution should
/// resume.
pub(crate) fn raise_synthetic_fault(kind: FaultKind, assertion: Option<AssertionInfo>) -> bool {
    let ptr = HANDLER.load(SeqCst);
    if ptr.is_null() {
        return false;
    }
    let mut desc = FaultDescriptor::new(kind, MachineContext::capture_current());
    desc.assertion = assertion;
    // Safety: see with_installed.
    unsafe { &*ptr }.handle_fault(desc)
}

/// Installs on creation, uninstalls on drop.  For hosts that want the
/// handler scoped to a region of the program rather than its whole life.
pub struct InstallGuard {
    _priv: (),
}

impl InstallGuard {
    pub fn new(config: CrashConfiguration) -> Result<Self, CrashError> {
        install(config)?;
        Ok(InstallGuard { _priv: () })
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        let _ = uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrancy_lock_same_thread() {
        let lock = ReentrancyLock::new();
        let guard = lock.acquire().unwrap();
        assert!(matches!(lock.acquire(), Err(CrashError::Reentrant)));
        drop(guard);
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_reentrancy_lock_cross_thread() {
        let lock = Arc::new(ReentrancyLock::new());
        let guard = lock.acquire().unwrap();
        let lock2 = Arc::clone(&lock);
        let waiter = std::thread::spawn(move || {
            // Blocks until the main thread releases, then succeeds.
            let _guard = lock2.acquire().unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
    }

    fn test_config(dir: &Path) -> CrashConfiguration {
        let mut config = CrashConfiguration::new(
            "lifecycle-app",
            "0.0.1",
            Some(PathBuf::from("/bin/true")),
            None,
            Some(dir.to_path_buf()),
            Default::default(),
            // Keep the fault surface minimal inside the test runner.
            HookMask::SIGTERM,
            None,
            Some(Duration::from_millis(200)),
            false,
            true,
        )
        .unwrap();
        config.set_output_dir(dir.to_path_buf());
        config
    }

    // One serialized test exercises the whole singleton lifecycle; the
    // handler is process-global, so splitting it across #[test] functions
    // would race.
    #[test]
    fn test_singleton_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_installed());
        assert!(matches!(uninstall(), Err(CrashError::NotInstalled)));
        assert!(matches!(
            with_installed(|_| Ok(())),
            Err(CrashError::NotInstalled)
        ));

        install(test_config(dir.path())).unwrap();
        assert!(is_installed());
        assert!(matches!(
            install(test_config(dir.path())),
            Err(CrashError::AlreadyInstalled)
        ));

        // Registration contract.
        let log = dir.path().join("app.log");
        std::fs::write(&log, b"log line\n").unwrap();
        with_installed(|h| h.add_file(&log, None, "application log", FileFlags::MAKE_COPY))
            .unwrap();
        assert!(matches!(
            with_installed(|h| h.add_file(&log, Some("app.log"), "", FileFlags::default())),
            Err(CrashError::DuplicateDestination(_))
        ));
        assert!(matches!(
            with_installed(|h| h.add_file(
                &dir.path().join("absent.txt"),
                None,
                "",
                FileFlags::default()
            )),
            Err(CrashError::MissingFile(_))
        ));
        with_installed(|h| {
            h.add_file(
                &dir.path().join("absent.txt"),
                Some("maybe-later.txt"),
                "may appear later",
                FileFlags::MISSING_FILE_OK,
            )
        })
        .unwrap();
        with_installed(|h| {
            h.add_file(&dir.path().join("*.trace"), Some("traces"), "", FileFlags::default())
        })
        .unwrap();
        with_installed(|h| h.add_property("build", "debug")).unwrap();
        with_installed(|h| h.add_property("build", "release")).unwrap();
        assert!(matches!(
            with_installed(|h| h.add_property("  ", "x")),
            Err(CrashError::InvalidPropertyName)
        ));

        // Manual report with a stage-recording callback.  /bin/true never
        // opens the fifo, so the cycle ends as a sync timeout, which is
        // still a successful report.
        let stages = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::clone(&stages);
        with_installed(|h| {
            h.set_crash_callback(Box::new(move |info| {
                recorded.fetch_add(
                    match info.stage {
                        CallbackStage::Prepare => 1,
                        CallbackStage::Finish => 0x100,
                    },
                    SeqCst,
                );
                CallbackAction::NotifyNextStage
            }));
            Ok(())
        })
        .unwrap();
        with_installed(|h| h.generate_error_report(None)).unwrap();
        assert_eq!(stages.load(SeqCst), 0x101);
        assert!(!last_error::message().is_empty()); // sync timeout noted

        // DoDefault suppresses the Finish notification.
        stages.store(0, SeqCst);
        let recorded = Arc::clone(&stages);
        with_installed(|h| {
            h.set_crash_callback(Box::new(move |info| {
                recorded.fetch_add(
                    match info.stage {
                        CallbackStage::Prepare => 1,
                        CallbackStage::Finish => 0x100,
                    },
                    SeqCst,
                );
                CallbackAction::DoDefault
            }));
            Ok(())
        })
        .unwrap();
        with_installed(|h| h.generate_error_report(None)).unwrap();
        assert_eq!(stages.load(SeqCst), 1);

        // Cancellation aborts before the reporter is launched.
        with_installed(|h| {
            h.set_crash_callback(Box::new(|_| CallbackAction::Cancel));
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            with_installed(|h| h.generate_error_report(None)),
            Err(CrashError::Cancelled)
        ));

        // The prepare stage runs without the state lock, so a callback may
        // register more files and properties for the report in flight.  The
        // report runs on a worker thread with a deadline so a regression
        // shows up as a failure instead of a hung test run.
        let cb_log = log.clone();
        with_installed(|h| {
            h.set_crash_callback(Box::new(move |info| {
                if info.stage == CallbackStage::Prepare {
                    with_installed(|h| h.add_property("callback.stage", "prepare")).unwrap();
                    with_installed(|h| {
                        h.add_file(&cb_log, Some("callback.log"), "", FileFlags::MISSING_FILE_OK)
                    })
                    .unwrap();
                }
                CallbackAction::NotifyNextStage
            }));
            Ok(())
        })
        .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(with_installed(|h| h.generate_error_report(None)));
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("report stalled behind a callback-side registration")
            .unwrap();
        with_installed(|h| {
            let state = h.lock_state();
            assert_eq!(
                state.properties.get("callback.stage").map(String::as_str),
                Some("prepare")
            );
            assert!(state.files.contains_key("callback.log"));
            Ok(())
        })
        .unwrap();

        // A panicking callback unwinds out of generate_error_report, but the
        // per-crash reinitialization still runs: the next cycle gets a fresh
        // crash id and a clean record.
        with_installed(|h| {
            h.set_crash_callback(Box::new(|info| {
                if info.stage == CallbackStage::Prepare {
                    panic!("host callback failure");
                }
                CallbackAction::NotifyNextStage
            }));
            Ok(())
        })
        .unwrap();
        let stale_id = with_installed(|h| Ok(h.lock_state().crash_id.clone())).unwrap();
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_installed(|h| h.generate_error_report(None))
        }));
        assert!(unwound.is_err());
        let fresh_id = with_installed(|h| Ok(h.lock_state().crash_id.clone())).unwrap();
        assert_ne!(stale_id, fresh_id);
        // The panicked callback was consumed; the next report runs bare.
        with_installed(|h| h.generate_error_report(None)).unwrap();

        // Per-thread registrations pin the process-wide handler.
        crate::handler::install_per_thread(HookMask::ALL).unwrap();
        assert!(matches!(
            uninstall(),
            Err(CrashError::PerThreadHandlersRemain(_))
        ));
        assert!(is_installed());
        crate::handler::uninstall_per_thread().unwrap();

        // The per-thread registry is process-global and other tests touch it
        // from their own threads; retry briefly instead of assuming an empty
        // registry on the first attempt.
        let mut result = uninstall();
        for _ in 0..100 {
            if !matches!(result, Err(CrashError::PerThreadHandlersRemain(_))) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
            result = uninstall();
        }
        result.unwrap();
        assert!(!is_installed());
        assert!(matches!(uninstall(), Err(CrashError::NotInstalled)));
    }
}
