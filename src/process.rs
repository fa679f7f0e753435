use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Exit status of a child process.
///
/// Wraps the platform's native representation: the raw `waitpid()` status on
/// Unix, the `GetExitCodeProcess()` code on Windows.  Query it through the
/// provided methods.
#[derive(Eq, PartialEq, Hash, Copy, Clone)]
pub struct ExitStatus(pub(crate) Option<os::RawStatus>);

impl ExitStatus {
    pub(crate) fn from_raw(raw: os::RawStatus) -> ExitStatus {
        ExitStatus(Some(raw))
    }

    /// A status that is known to be unavailable, e.g. because the command
    /// was skipped by `&&`/`||` short-circuiting.
    pub(crate) fn undetermined() -> ExitStatus {
        ExitStatus(None)
    }

    /// True if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// True if the process was killed by the signal with the given number.
    ///
    /// Always returns `false` on Windows.
    pub fn is_killed_by(&self, signum: i32) -> bool {
        self.signal() == Some(signum)
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitStatus({})", self)
    }
}

/// A handle to a running or finished child process.
///
/// `Process` tracks one child's lifecycle for the pipeline executor.  All
/// methods take `&self`, and the handle is cheaply cloneable; clones share
/// the same state, so the host can poll or signal a child that a pipeline
/// driver thread is concurrently waiting on.  Waiters block on a condition
/// variable, the same notification style the capture buffer uses, so a
/// waiting thread never holds the state lock while the child runs and
/// signals are never delayed by an in-progress wait.
#[derive(Clone)]
pub struct Process(Arc<ChildHandle>);

struct ChildHandle {
    pid: u32,
    state: Mutex<ChildState>,
    exited: Condvar,
    #[cfg(windows)]
    handle: crate::win32::Handle,
}

#[derive(Debug)]
enum ChildState {
    Running,
    // A helper thread is blocked collecting the child; its result arrives
    // through the condvar.
    #[cfg(unix)]
    Reaping,
    Done(ExitStatus),
}

impl Process {
    #[cfg(unix)]
    pub(crate) fn new(pid: u32) -> Process {
        Process(Arc::new(ChildHandle {
            pid,
            state: Mutex::new(ChildState::Running),
            exited: Condvar::new(),
        }))
    }

    #[cfg(windows)]
    pub(crate) fn new(pid: u32, handle: crate::win32::Handle) -> Process {
        Process(Arc::new(ChildHandle {
            pid,
            state: Mutex::new(ChildState::Running),
            exited: Condvar::new(),
            handle,
        }))
    }

    /// Returns the PID of the child.
    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// Returns the exit status, if the child is known to have finished.
    ///
    /// This performs no system calls; use [`poll`](Self::poll) or
    /// [`wait`](Self::wait) to check whether the child has finished.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match &*self.0.state.lock().unwrap() {
            ChildState::Done(status) => Some(*status),
            _ => None,
        }
    }

    /// Check whether the child has finished, without blocking.
    pub fn poll(&self) -> Option<ExitStatus> {
        os::wait_deadline(&self.0, Some(Instant::now())).unwrap_or(None)
    }

    /// Wait for the child to finish and return its exit status.
    ///
    /// If the child has already finished, returns the recorded status
    /// immediately.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        match os::wait_deadline(&self.0, None)? {
            Some(status) => Ok(status),
            None => unreachable!("wait without a deadline cannot time out"),
        }
    }

    /// Wait for the child to finish, timing out after the given duration.
    ///
    /// Returns `Ok(None)` if the timeout elapsed before the child finished.
    pub fn wait_timeout(&self, dur: Duration) -> io::Result<Option<ExitStatus>> {
        os::wait_deadline(&self.0, Some(Instant::now() + dur))
    }

    /// Terminate the child.
    ///
    /// On Unix this sends SIGTERM; on Windows it calls `TerminateProcess`.
    /// Does nothing if the child is known to have finished.
    pub fn terminate(&self) -> io::Result<()> {
        os::terminate(&self.0)
    }

    /// Kill the child.
    ///
    /// On Unix this sends SIGKILL; on Windows it calls `TerminateProcess`.
    /// Does nothing if the child is known to have finished.
    pub fn kill(&self) -> io::Result<()> {
        os::kill(&self.0)
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        os::reap_on_drop(self);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock().unwrap();
        f.debug_struct("Process")
            .field("pid", &self.0.pid)
            .field("state", &*state)
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use super::*;
    use crate::posix;
    use std::thread;

    pub type RawStatus = i32;

    enum Decoded {
        Exited(u32),
        Signaled(i32),
        Other(i32),
    }

    fn decode(raw: RawStatus) -> Decoded {
        if libc::WIFEXITED(raw) {
            Decoded::Exited(libc::WEXITSTATUS(raw) as u32)
        } else if libc::WIFSIGNALED(raw) {
            Decoded::Signaled(libc::WTERMSIG(raw))
        } else {
            Decoded::Other(raw)
        }
    }

    impl ExitStatus {
        /// Returns the exit code if the process exited normally.
        ///
        /// On Unix, this returns `Some` only if the process exited
        /// voluntarily (not killed by a signal).
        pub fn code(&self) -> Option<u32> {
            match self.0.map(decode) {
                Some(Decoded::Exited(code)) => Some(code),
                _ => None,
            }
        }

        /// Returns the signal number if the process was killed by a signal.
        pub fn signal(&self) -> Option<i32> {
            match self.0.map(decode) {
                Some(Decoded::Signaled(signal)) => Some(signal),
                _ => None,
            }
        }
    }

    impl fmt::Display for ExitStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.0.map(decode) {
                Some(Decoded::Exited(code)) => write!(f, "exited with {}", code),
                Some(Decoded::Signaled(signal)) => write!(f, "killed by signal {}", signal),
                Some(Decoded::Other(raw)) => write!(f, "wait status {:#x}", raw),
                None => f.write_str("no exit status"),
            }
        }
    }

    pub(super) fn wait_deadline(
        handle: &Arc<ChildHandle>,
        deadline: Option<Instant>,
    ) -> io::Result<Option<ExitStatus>> {
        let mut state = handle.state.lock().unwrap();
        loop {
            match *state {
                ChildState::Done(status) => return Ok(Some(status)),
                ChildState::Running => {
                    // The child may already be gone; look before committing
                    // to a blocking wait.
                    if let Some(status) = check_child(handle.pid)? {
                        *state = ChildState::Done(status);
                        handle.exited.notify_all();
                        continue;
                    }
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(None);
                    }
                    *state = ChildState::Reaping;
                    start_reaper(Arc::clone(handle));
                }
                ChildState::Reaping => match deadline {
                    None => state = handle.exited.wait(state).unwrap(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(None);
                        }
                        state = handle
                            .exited
                            .wait_timeout(state, deadline - now)
                            .unwrap()
                            .0;
                    }
                },
            }
        }
    }

    // One thread per child performs the blocking waitpid and publishes the
    // result; every waiter sleeps on the condvar.  waitpid stays outside
    // the state lock, so signals can be sent while the wait is in progress.
    fn start_reaper(handle: Arc<ChildHandle>) {
        thread::spawn(move || {
            let status = match posix::wait_child(handle.pid, 0) {
                Ok(Some(raw)) => ExitStatus::from_raw(raw),
                // Blocking waits only return with a status or an error; an
                // error (ECHILD included) means the status is untraceable.
                _ => ExitStatus::undetermined(),
            };
            let mut state = handle.state.lock().unwrap();
            *state = ChildState::Done(status);
            handle.exited.notify_all();
        });
    }

    fn check_child(pid: u32) -> io::Result<Option<ExitStatus>> {
        match posix::wait_child(pid, posix::WNOHANG) {
            Ok(Some(raw)) => Ok(Some(ExitStatus::from_raw(raw))),
            Ok(None) => Ok(None),
            // Some other party collected the child; the PID no longer
            // exists and the status cannot be recovered.
            Err(err) if err.raw_os_error() == Some(posix::ECHILD) => {
                Ok(Some(ExitStatus::undetermined()))
            }
            Err(err) => Err(err),
        }
    }

    pub(super) fn terminate(handle: &ChildHandle) -> io::Result<()> {
        send_signal(handle, posix::SIGTERM)
    }

    pub(super) fn kill(handle: &ChildHandle) -> io::Result<()> {
        send_signal(handle, posix::SIGKILL)
    }

    fn send_signal(handle: &ChildHandle, signal: i32) -> io::Result<()> {
        let state = handle.state.lock().unwrap();
        match *state {
            ChildState::Done(_) => Ok(()),
            _ => posix::kill(handle.pid, signal),
        }
    }

    pub(super) fn reap_on_drop(handle: &mut ChildHandle) {
        // Collect the child if it has already exited, to avoid leaving a
        // zombie.  A live child stays running.  (A reaper thread keeps the
        // handle alive through its Arc, so Reaping never reaches drop.)
        if matches!(*handle.state.get_mut().unwrap(), ChildState::Running) {
            let _ = posix::wait_child(handle.pid, posix::WNOHANG);
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use crate::win32;

    pub type RawStatus = u32;

    impl ExitStatus {
        /// Returns the exit code if the process exited normally.
        ///
        /// On Windows, this always returns `Some` for a determined exit
        /// status.
        pub fn code(&self) -> Option<u32> {
            self.0
        }

        /// Returns the signal number if the process was killed by a signal.
        ///
        /// Always returns `None` on Windows.
        pub fn signal(&self) -> Option<i32> {
            None
        }
    }

    impl fmt::Display for ExitStatus {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.0 {
                Some(code) => write!(f, "exited with {}", code),
                None => f.write_str("no exit status"),
            }
        }
    }

    pub(super) fn wait_deadline(
        handle: &Arc<ChildHandle>,
        deadline: Option<Instant>,
    ) -> io::Result<Option<ExitStatus>> {
        {
            let state = handle.state.lock().unwrap();
            if let ChildState::Done(status) = *state {
                return Ok(Some(status));
            }
        }
        // Process handles can be waited on from any number of threads at
        // once, so no helper thread is involved here.
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if !win32::wait_handle(&handle.handle, timeout)? {
            return Ok(None);
        }
        let status = ExitStatus::from_raw(win32::exit_code(&handle.handle)?);
        let mut state = handle.state.lock().unwrap();
        *state = ChildState::Done(status);
        handle.exited.notify_all();
        Ok(Some(status))
    }

    pub(super) fn terminate(handle: &ChildHandle) -> io::Result<()> {
        let mut state = handle.state.lock().unwrap();
        if matches!(*state, ChildState::Done(_)) {
            return Ok(());
        }
        match win32::terminate_process(&handle.handle, 1) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Terminating a process that just exited is refused with
                // access-denied; check whether that is what happened.
                let code = win32::exit_code(&handle.handle)?;
                if code == win32::STILL_ACTIVE {
                    return Err(err);
                }
                *state = ChildState::Done(ExitStatus::from_raw(code));
                Ok(())
            }
        }
    }

    pub(super) fn kill(handle: &ChildHandle) -> io::Result<()> {
        terminate(handle)
    }

    pub(super) fn reap_on_drop(_handle: &mut ChildHandle) {
        // Closing the process handle is all the cleanup Windows needs.
    }
}
