// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Spawning the out-of-process reporter and waiting for its completion
//! signal.
//!
//! Everything the spawn needs (argument and environment CStrings, the open
//! FIFO read end) is prepared ahead of time, so the in-crash path performs no
//! allocation: fork, execve, poll, reap.

use libc::{nfds_t, poll, pollfd, POLLHUP, POLLIN};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{mkfifo, Pid};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to fork reporter process: errno {0}")]
    ForkFailed(i32),
    #[error("Reporter binary path contains an interior NUL byte")]
    BadBinaryPath,
    #[error("Reporter argument or environment entry contains an interior NUL byte")]
    BadArgument,
    #[error("Failed to create sync fifo {0}: {1}")]
    FifoCreateFailed(PathBuf, nix::Error),
    #[error("Failed to open sync fifo {0}: {1}")]
    FifoOpenFailed(PathBuf, std::io::Error),
    #[error("Poll on sync fifo failed with errno: {0}")]
    PollFailed(i32),
    #[error("Poll on sync fifo returned unexpected revents: {0}")]
    UnexpectedPollResult(i16),
}

/// Deadline bookkeeping shared by the fifo wait and the child reaper.
/// `remaining()` never reports less than a floor that covers a few scheduler
/// slices, so a nearly-expired deadline still gives the child a chance to
/// run.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    // 4ms per sched slice, give ~4x10 slices for safety
    const MINIMUM_REAP_TIME: Duration = Duration::from_millis(160);

    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        let elapsed = self.start_time.elapsed();
        if elapsed >= self.timeout {
            Self::MINIMUM_REAP_TIME
        } else {
            (self.timeout - elapsed).max(Self::MINIMUM_REAP_TIME)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("start_time", &self.start_time)
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

// The CString vectors are storage for the pointer arrays; they're
// unreferenced after construction but must stay alive.
#[allow(dead_code)]
pub struct PreparedExecve {
    binary_path: CString,
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    env_vars_cstrings: Vec<CString>,
    env_vars_ptrs: Vec<*const libc::c_char>,
}

// The raw pointers point into the owned CStrings above.
unsafe impl Send for PreparedExecve {}

impl PreparedExecve {
    /// Converts the full argv/envp to CStrings up front.  An interior NUL
    /// byte anywhere fails the construction: silently dropping an entry
    /// would shift the reporter's positional arguments.
    pub fn new(binary_path: &Path, args: &[String], env: &[(String, String)]) -> Result<Self, LaunchError> {
        let binary_path = CString::new(binary_path.as_os_str().as_encoded_bytes())
            .map_err(|_| LaunchError::BadBinaryPath)?;

        let args_cstrings: Vec<CString> = args
            .iter()
            .map(|s| CString::new(s.as_str()).map_err(|_| LaunchError::BadArgument))
            .collect::<Result<_, _>>()?;
        let args_ptrs: Vec<*const libc::c_char> = args_cstrings
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null())) // execve wants a null-terminated array
            .collect();

        let env_vars_cstrings: Vec<CString> = env
            .iter()
            .map(|(key, value)| {
                CString::new(format!("{key}={value}")).map_err(|_| LaunchError::BadArgument)
            })
            .collect::<Result<_, _>>()?;
        let env_vars_ptrs: Vec<*const libc::c_char> = env_vars_cstrings
            .iter()
            .map(|env| env.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            binary_path,
            args_cstrings,
            args_ptrs,
            env_vars_cstrings,
            env_vars_ptrs,
        })
    }

    /// Calls `execve` on the prepared arguments.  Only returns on failure.
    pub fn exec(&self) -> Result<(), Errno> {
        // Safety: construction guarantees both arrays are well-formed and
        // null-terminated.
        unsafe {
            if libc::execve(
                self.binary_path.as_ptr(),
                self.args_ptrs.as_ptr(),
                self.env_vars_ptrs.as_ptr(),
            ) == -1
            {
                Err(Errno::last())
            } else {
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn argv_len(&self) -> usize {
        self.args_ptrs.len()
    }
}

/// Kills the program without raising an abort or calling at_exit.
pub fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

#[cfg(target_os = "macos")]
pub(crate) fn alt_fork() -> i32 {
    // macOS has a lower-level `__fork()`, but the runtime is much stricter
    // about what the child may do afterwards, which defeats the purpose.
    // macOS lives with atfork handlers.
    unsafe { libc::fork() }
}

#[cfg(target_os = "linux")]
fn is_being_traced() -> std::io::Result<bool> {
    // Reads procfs; where procfs is unavailable, ptrace presumably is too,
    // and the caller treats failure as false.
    use std::io::BufRead;
    let file = std::fs::File::open("/proc/self/status")?;
    let reader = std::io::BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        if line.starts_with("TracerPid:") {
            let tracer_pid = line.split_whitespace().nth(1).unwrap_or("0");
            return Ok(tracer_pid != "0");
        }
    }
    Ok(false)
}

/// Forks without running atfork handlers.  Those handlers may take locks or
/// allocate, neither of which is survivable in a crashed process.
#[cfg(target_os = "linux")]
pub(crate) fn alt_fork() -> libc::pid_t {
    use libc::{
        c_ulong, c_void, pid_t, syscall, SYS_clone, CLONE_CHILD_CLEARTID, CLONE_CHILD_SETTID,
        CLONE_PTRACE, SIGCHLD,
    };

    let mut _ptid: pid_t = 0;
    let mut _ctid: pid_t = 0;

    // A tracer must be told about the child or it loses it across the clone.
    let being_traced = is_being_traced().unwrap_or(false);
    let extra_flags = if being_traced { CLONE_PTRACE } else { 0 };

    // Direct syscall into clone() with the flags glibc fork() would use,
    // minus the atfork handler invocation.
    let res = unsafe {
        syscall(
            SYS_clone,
            (CLONE_CHILD_CLEARTID | CLONE_CHILD_SETTID | SIGCHLD | extra_flags) as c_ulong,
            std::ptr::null_mut::<c_void>(),
            &mut _ptid as *mut pid_t,
            &mut _ctid as *mut pid_t,
            0 as c_ulong,
        )
    };

    if res > pid_t::MAX as i64 {
        pid_t::MAX
    } else if res < pid_t::MIN as i64 {
        pid_t::MIN
    } else {
        res as pid_t
    }
}

/// Non-blocking child reaper.
/// * If the child process has exited, returns true
/// * If the child process cannot be found, returns false
/// * If the child is still alive past the deadline, returns an error
pub fn reap_child_non_blocking(pid: Pid, timeout_manager: &TimeoutManager) -> Result<bool, nix::Error> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.expired() {
                    return Ok(false);
                }
                std::thread::sleep(Duration::from_millis(4));
            }
            Ok(_status) => return Ok(true),
            Err(nix::Error::ECHILD) => {
                // Someone else reaped it (a host-installed SIGCHLD handler);
                // either way there is nothing further to do.
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
}

/// The completion rendezvous between the faulting process and the reporter.
///
/// The faulting process creates the FIFO and holds the read end open from
/// install time; the reporter opens the write end and writes a byte once the
/// work that needs the faulting process alive is done.  A reporter that dies
/// early produces POLLHUP instead, which also ends the wait.
pub struct SyncFifo {
    path: PathBuf,
    fd: OwnedFd,
}

impl SyncFifo {
    pub fn create(path: &Path) -> Result<Self, LaunchError> {
        mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| LaunchError::FifoCreateFailed(path.to_path_buf(), e))?;
        // O_NONBLOCK: opening the read end must not wait for a writer.
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                let _ = std::fs::remove_file(path);
                LaunchError::FifoOpenFailed(path.to_path_buf(), e)
            })?;
        Ok(SyncFifo {
            path: path.to_path_buf(),
            fd: file.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until the reporter signals (POLLIN), dies (POLLHUP), or the
    /// deadline passes.  Returns true only for an actual signal or hangup.
    pub fn wait_signalled(&self, timeout_manager: &TimeoutManager) -> Result<bool, LaunchError> {
        let mut poll_fds = [pollfd {
            fd: self.fd.as_raw_fd(),
            events: POLLIN | POLLHUP,
            revents: 0,
        }];

        loop {
            if timeout_manager.expired() {
                return Ok(false);
            }
            let timeout_ms = timeout_manager.remaining().as_millis() as i32;
            let poll_result =
                unsafe { poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) };
            match poll_result {
                -1 => match nix::Error::last_raw() {
                    libc::EAGAIN | libc::EINTR => continue,
                    errno => return Err(LaunchError::PollFailed(errno)),
                },
                0 => return Ok(false),
                _ => {
                    let revents = poll_fds[0].revents;
                    if revents & (POLLIN | POLLHUP) != 0 {
                        return Ok(true);
                    }
                    return Err(LaunchError::UnexpectedPollResult(revents));
                }
            }
        }
    }
}

impl Drop for SyncFifo {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A fully prepared reporter launch: ready to fork/exec without touching the
/// heap or the filesystem.
pub struct PreparedLaunch {
    execve: PreparedExecve,
}

impl PreparedLaunch {
    pub fn new(
        reporter_path: &Path,
        crash_id: &str,
        fifo_path: &Path,
    ) -> Result<Self, LaunchError> {
        let args = vec![
            reporter_path.to_string_lossy().into_owned(),
            crash_id.to_string(),
            fifo_path.to_string_lossy().into_owned(),
        ];
        let env: Vec<(String, String)> = std::env::vars().collect();
        Ok(PreparedLaunch {
            execve: PreparedExecve::new(reporter_path, &args, &env)?,
        })
    }
}

/// Outcome of a reporter launch.
#[derive(Debug, Copy, Clone)]
pub struct LaunchResult {
    pub pid: i32,
    /// True when the reporter signalled completion within the deadline;
    /// false means the wait timed out and the reporter was left running.
    pub synced: bool,
}

/// Forks and execs the reporter, then waits (bounded) for its completion
/// signal on the fifo.  A synced reporter is also reaped so it does not
/// linger as a zombie; an unsynced one is left to init.
pub fn launch_reporter(
    launch: &PreparedLaunch,
    fifo: &SyncFifo,
    timeout: Duration,
) -> Result<LaunchResult, LaunchError> {
    let pid = alt_fork();
    if pid < 0 {
        return Err(LaunchError::ForkFailed(Errno::last_raw()));
    }
    if pid == 0 {
        // Child.  Only returns on exec failure; nothing downstream of a
        // failed exec is recoverable here.
        let _ = launch.execve.exec();
        terminate();
    }

    let manager = TimeoutManager::new(timeout);
    let synced = fifo.wait_signalled(&manager)?;
    if synced {
        // Best effort; the reporter may outlive the sync signal on purpose
        // (asynchronous delivery) and be reparented instead.
        let _ = reap_child_non_blocking(Pid::from_raw(pid), &manager);
    }
    Ok(LaunchResult { pid, synced })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_timeout_manager_new() {
        let timeout = Duration::from_secs(5);
        let manager = TimeoutManager::new(timeout);

        assert_eq!(manager.timeout(), timeout);
        assert!(manager.elapsed() < Duration::from_millis(100));
        assert!(manager.remaining() >= TimeoutManager::MINIMUM_REAP_TIME);
        assert!(!manager.expired());
    }

    #[test]
    fn test_timeout_manager_floor_applies_to_tiny_deadline() {
        let manager = TimeoutManager::new(Duration::from_millis(50));
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
    }

    #[test]
    fn test_timeout_manager_remaining_after_expiry() {
        let manager = TimeoutManager::new(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(manager.expired());
        assert!(manager.elapsed() > manager.timeout());
        // Expiry never makes remaining() go to zero or wrap.
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_REAP_TIME);
    }

    #[test]
    fn test_prepared_execve_terminates_argv() {
        let prepared = PreparedExecve::new(
            Path::new("/bin/true"),
            &["true".to_string(), "arg".to_string()],
            &[("KEY".to_string(), "value".to_string())],
        )
        .unwrap();
        // Two args plus the null terminator.
        assert_eq!(prepared.argv_len(), 3);
    }

    #[test]
    fn test_prepared_execve_rejects_nul_in_path(){
        let path = PathBuf::from("bad\0path");
        assert!(matches!(
            PreparedExecve::new(&path, &[], &[]),
            Err(LaunchError::BadBinaryPath)
        ));
    }

    #[test]
    fn test_prepared_execve_rejects_nul_in_args_and_env() {
        // A dropped argv entry would shift the positional arguments, so a
        // bad entry fails the whole construction instead.
        assert!(matches!(
            PreparedExecve::new(Path::new("/bin/true"), &["a\0b".to_string()], &[]),
            Err(LaunchError::BadArgument)
        ));
        assert!(matches!(
            PreparedExecve::new(
                Path::new("/bin/true"),
                &[],
                &[("KEY".to_string(), "va\0lue".to_string())],
            ),
            Err(LaunchError::BadArgument)
        ));
    }

    #[test]
    fn test_sync_fifo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.sync");
        let fifo = SyncFifo::create(&path).unwrap();

        // No writer yet: times out.
        let manager = TimeoutManager::new(Duration::from_millis(1));
        assert!(!fifo.wait_signalled(&manager).unwrap());

        // Writer signals: wait ends promptly.
        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            let mut f = OpenOptions::new().write(true).open(writer_path).unwrap();
            f.write_all(&[1]).unwrap();
        });
        let manager = TimeoutManager::new(Duration::from_secs(10));
        assert!(fifo.wait_signalled(&manager).unwrap());
        writer.join().unwrap();
    }

    #[test]
    fn test_sync_fifo_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sync");
        drop(SyncFifo::create(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_duplicate_fifo_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.sync");
        let _first = SyncFifo::create(&path).unwrap();
        assert!(matches!(
            SyncFifo::create(&path),
            Err(LaunchError::FifoCreateFailed(..))
        ));
    }
}
