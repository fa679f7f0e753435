use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr;

pub use libc::ECHILD;
pub use libc::WNOHANG;
pub use libc::{SIGKILL, SIGTERM};

// A negative return means errno holds the details.
fn cvt<T: Ord + Default>(res: T) -> Result<T> {
    if res < T::default() {
        Err(Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Create a pipe.  Both ends start out close-on-exec; installing an end as
/// a child's standard stream clears the flag on the installed copy, so no
/// other pipe leaks across `exec`.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let read = unsafe { File::from_raw_fd(fds[0]) };
    let write = unsafe { File::from_raw_fd(fds[1]) };
    set_cloexec(&read, true)?;
    set_cloexec(&write, true)?;
    Ok((read, write))
}

pub fn set_cloexec(f: &File, on: bool) -> Result<()> {
    let fd = f.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) })?;
    Ok(())
}

/// Duplicate a descriptor into an owned `File`, numbered above the standard
/// streams and close-on-exec.  Used to hand an inherited stream to a child
/// under a different number, e.g. for `1>&2`.
pub fn dup(fd: i32) -> Result<File> {
    let new = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) })?;
    Ok(unsafe { File::from_raw_fd(new) })
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    cvt(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

/// Fork the process.  Returns `Some(child_pid)` in the parent and `None` in
/// the child.
///
/// # Safety
///
/// The child must restrict itself to async-signal-safe operations until it
/// calls `exec` or `_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = cvt(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

/// Wait for `pid`.  Returns the raw wait status once the child has been
/// collected, or `None` when `WNOHANG` was requested and the child is still
/// running.  Interrupted waits are retried.
pub fn wait_child(pid: u32, flags: i32) -> Result<Option<i32>> {
    let mut status = 0 as libc::c_int;
    loop {
        let reaped = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, flags) };
        if reaped == pid as libc::pid_t {
            return Ok(Some(status));
        }
        if reaped == 0 {
            return Ok(None);
        }
        let err = Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    cvt(unsafe { libc::kill(pid as libc::pid_t, signal as libc::c_int) })?;
    Ok(())
}

/// Undo the signal setup a Rust parent leaves behind, between fork and
/// exec: unblock everything and give SIGPIPE back its default disposition,
/// which programs writing into pipes rely on.
pub fn restore_signal_defaults() -> Result<()> {
    unsafe {
        let mut empty = MaybeUninit::<libc::sigset_t>::uninit();
        cvt(libc::sigemptyset(empty.as_mut_ptr()))?;
        cvt(libc::pthread_sigmask(
            libc::SIG_SETMASK,
            empty.as_ptr(),
            ptr::null_mut(),
        ))?;
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    let bytes = s.as_bytes();
    if bytes.contains(&0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    // Unix paths and arguments are C strings already, minus the terminator.
    Ok(CString::new(bytes).expect("NUL-checked bytes"))
}

/// Prepare an `exec` of `cmd` with `argv` and optionally `env`, returning a
/// closure that performs it.
///
/// All allocation happens here, before the fork; the returned closure only
/// reads the prepared arrays, making it safe to call from the child.  On
/// success the closure does not return.
pub fn prep_exec(
    cmd: &OsStr,
    argv: &[OsString],
    env: Option<&[OsString]>,
) -> Result<impl FnOnce() -> Result<()>> {
    let cmd = os_to_cstring(cmd)?;
    let argv: Vec<CString> = argv
        .iter()
        .map(|a| os_to_cstring(a))
        .collect::<Result<_>>()?;
    let env: Option<Vec<CString>> = env
        .map(|env| env.iter().map(|e| os_to_cstring(e)).collect())
        .transpose()?;

    fn ptr_vec(strings: &[CString]) -> Vec<*const libc::c_char> {
        strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect()
    }

    let argv_ptrs = ptr_vec(&argv);
    let env_ptrs = env.as_deref().map(ptr_vec);

    Ok(move || {
        // The pointer arrays reference heap storage owned by the captured
        // CStrings, which the closure keeps alive.
        let _keepalive = (&argv, &env);
        unsafe {
            match &env_ptrs {
                Some(env_ptrs) => {
                    libc::execve(cmd.as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr())
                }
                None => libc::execv(cmd.as_ptr(), argv_ptrs.as_ptr()),
            };
        }
        Err(Error::last_os_error())
    })
}
