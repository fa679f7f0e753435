//! Thin wrappers over the Windows process, handle and pipe primitives used
//! by the spawn layer.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Error, Result};
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, RawHandle};
use std::ptr;
use std::time::{Duration, Instant};

use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::{self, INVALID_HANDLE_VALUE};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::namedpipeapi::CreatePipe;
use winapi::um::processthreadsapi::{self, CreateProcessW, PROCESS_INFORMATION, STARTUPINFOW};
use winapi::um::winbase::{
    CREATE_UNICODE_ENVIRONMENT, INFINITE, STARTF_USESTDHANDLES, STD_ERROR_HANDLE,
    STD_INPUT_HANDLE, STD_OUTPUT_HANDLE, WAIT_ABANDONED, WAIT_FAILED, WAIT_OBJECT_0,
};
use winapi::um::winnt::DUPLICATE_SAME_ACCESS;
use winapi::um::{processenv, synchapi};

/// The exit code `GetExitCodeProcess` reports for a live process.
pub const STILL_ACTIVE: u32 = 259;

pub const STD_INPUT: u32 = STD_INPUT_HANDLE;
pub const STD_OUTPUT: u32 = STD_OUTPUT_HANDLE;
pub const STD_ERROR: u32 = STD_ERROR_HANDLE;

const HANDLE_FLAG_INHERIT: DWORD = 1;

/// An owned Windows handle, closed on drop.
#[derive(Debug)]
pub struct Handle(RawHandle);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            handleapi::CloseHandle(self.0);
        }
    }
}

impl AsRawHandle for Handle {
    fn as_raw_handle(&self) -> RawHandle {
        self.0
    }
}

fn nonzero(status: BOOL) -> Result<()> {
    if status == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

fn valid(handle: RawHandle) -> Result<RawHandle> {
    if handle == INVALID_HANDLE_VALUE {
        Err(Error::last_os_error())
    } else {
        Ok(handle)
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(iter::once(0)).collect()
}

/// Create an anonymous pipe; both ends start out non-inheritable.
pub fn make_pipe() -> Result<(File, File)> {
    use std::os::windows::io::FromRawHandle;

    let mut read: RawHandle = ptr::null_mut();
    let mut write: RawHandle = ptr::null_mut();
    let mut attrs = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: FALSE,
    };
    nonzero(unsafe { CreatePipe(&mut read, &mut write, &mut attrs, 0) })?;
    Ok(unsafe { (File::from_raw_handle(read), File::from_raw_handle(write)) })
}

/// Mark a handle as inheritable (or not) by child processes.
pub fn set_inheritable(file: &File, on: bool) -> Result<()> {
    nonzero(unsafe {
        handleapi::SetHandleInformation(
            file.as_raw_handle(),
            HANDLE_FLAG_INHERIT,
            if on { HANDLE_FLAG_INHERIT } else { 0 },
        )
    })
}

/// The raw handle of one of the parent's standard streams, for passing to a
/// child.  The handle is borrowed, not owned.
pub fn std_stream_handle(which: u32) -> Result<RawHandle> {
    valid(unsafe { processenv::GetStdHandle(which) })
}

/// Duplicate one of the parent's standard streams into an owned handle.
pub fn dup_std_stream(which: u32) -> Result<File> {
    use std::os::windows::io::FromRawHandle;

    let source = std_stream_handle(which)?;
    let me = unsafe { processthreadsapi::GetCurrentProcess() };
    let mut duplicated: RawHandle = ptr::null_mut();
    nonzero(unsafe {
        handleapi::DuplicateHandle(
            me,
            source,
            me,
            &mut duplicated,
            0,
            FALSE,
            DUPLICATE_SAME_ACCESS,
        )
    })?;
    Ok(unsafe { File::from_raw_handle(duplicated) })
}

/// Create a process running `program` with the given command line,
/// environment block, working directory and standard stream handles.
/// Returns the process handle and PID.
pub fn spawn_process(
    program: &OsStr,
    cmdline: &OsStr,
    env_block: Option<&[u16]>,
    cwd: Option<&OsStr>,
    streams: [RawHandle; 3],
) -> Result<(Handle, u32)> {
    let program = wide(program);
    let mut cmdline = wide(cmdline);
    let cwd = cwd.map(wide);

    let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
    startup.cb = mem::size_of::<STARTUPINFOW>() as DWORD;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = streams[0];
    startup.hStdOutput = streams[1];
    startup.hStdError = streams[2];

    let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    nonzero(unsafe {
        CreateProcessW(
            program.as_ptr(),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            TRUE, // inherit the handles marked for inheritance
            CREATE_UNICODE_ENVIRONMENT,
            env_block.map(|b| b.as_ptr()).unwrap_or(ptr::null()) as LPVOID,
            cwd.as_ref().map(|w| w.as_ptr()).unwrap_or(ptr::null()),
            &mut startup,
            &mut info,
        )
    })?;
    // Only the process handle is of interest.
    drop(Handle(info.hThread));
    Ok((Handle(info.hProcess), info.dwProcessId as u32))
}

/// Wait for a handle to become signaled.  Returns `false` if the timeout
/// expired first; `None` waits indefinitely.
pub fn wait_handle(handle: &Handle, timeout: Option<Duration>) -> Result<bool> {
    // The wait takes 32-bit milliseconds; longer waits are chopped into
    // slices with the deadline re-checked in between.
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            None => INFINITE,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_millis().min((INFINITE - 1) as u128) as DWORD
            }
        };
        match unsafe { synchapi::WaitForSingleObject(handle.0, slice) } {
            WAIT_OBJECT_0 | WAIT_ABANDONED => return Ok(true),
            WAIT_TIMEOUT => match deadline {
                Some(deadline) if Instant::now() < deadline => continue,
                _ => return Ok(false),
            },
            WAIT_FAILED => return Err(Error::last_os_error()),
            other => panic!("unexpected wait result {}", other),
        }
    }
}

/// The exit code of a process, or [`STILL_ACTIVE`] while it runs.
pub fn exit_code(handle: &Handle) -> Result<u32> {
    let mut code = 0u32;
    nonzero(unsafe {
        processthreadsapi::GetExitCodeProcess(handle.0, &mut code as *mut u32)
    })?;
    Ok(code)
}

/// Force a process to exit with the given code.
pub fn terminate_process(handle: &Handle, code: u32) -> Result<()> {
    nonzero(unsafe { processthreadsapi::TerminateProcess(handle.0, code) })
}
