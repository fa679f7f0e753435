use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::process::Process;

pub(crate) use os::{dup_inherited, make_pipe};

/// The file a child should see on one of its standard descriptors, shared
/// with whoever else needs the same descriptor.
///
/// Using `Arc<File>` lets merged streams (`2>&1`) and descriptor swaps
/// reference one underlying descriptor without extra `dup` syscalls, and
/// lets a group redirection share one opened file among all its commands.
/// `None` means the descriptor is inherited from the parent.
pub(crate) type ChildEnd = Option<Arc<File>>;

/// Spawn a child process with the given standard stream ends installed.
///
/// `executable` must already be resolved to a concrete program path; `argv`
/// is passed to the child verbatim (including `argv[0]`).  `env` of `None`
/// inherits the parent environment, `Some` replaces it wholesale, with
/// later duplicates overriding earlier ones.
pub(crate) fn spawn(
    executable: &OsStr,
    argv: &[OsString],
    env: Option<&[(OsString, OsString)]>,
    cwd: Option<&OsStr>,
    stdin: ChildEnd,
    stdout: ChildEnd,
    stderr: ChildEnd,
) -> io::Result<Process> {
    if argv.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "argv must not be empty",
        ));
    }
    os::os_start(executable, argv, env, cwd, (stdin, stdout, stderr))
}

// Flatten (key, value) pairs into "key=value" entries, keeping the first
// occurrence's position but the last occurrence's value.
#[cfg(unix)]
fn flatten_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    use std::collections::HashMap;

    let mut positions: HashMap<&OsStr, usize> = HashMap::new();
    let mut entries: Vec<(&OsStr, &OsStr)> = Vec::new();
    for (key, value) in env {
        match positions.get(&key.as_os_str()) {
            Some(&at) => entries[at].1 = value,
            None => {
                positions.insert(key, entries.len());
                entries.push((key, value));
            }
        }
    }
    entries
        .into_iter()
        .map(|(key, value)| {
            let mut entry = key.to_owned();
            entry.push("=");
            entry.push(value);
            entry
        })
        .collect()
}

#[cfg(unix)]
mod os {
    use super::*;
    use crate::posix;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    /// Create a pipe; both ends are close-on-exec.
    pub fn make_pipe() -> io::Result<(File, File)> {
        posix::pipe()
    }

    /// Duplicate one of the parent's descriptors into an owned `File`, for
    /// handing an inherited stream to a child under another number.
    pub fn dup_inherited(fd: i32) -> io::Result<File> {
        posix::dup(fd)
    }

    pub(crate) fn os_start(
        executable: &OsStr,
        argv: &[OsString],
        env: Option<&[(OsString, OsString)]>,
        cwd: Option<&OsStr>,
        child_ends: (ChildEnd, ChildEnd, ChildEnd),
    ) -> io::Result<Process> {
        let (mut report_read, mut report_write) = posix::pipe()?;

        let child_env = env.map(flatten_env);
        let exec = posix::prep_exec(executable, argv, child_env.as_deref())?;

        let pid = unsafe {
            match posix::fork()? {
                Some(pid) => pid,
                None => {
                    drop(report_read);
                    let err = enter_child(exec, child_ends, cwd);
                    let errno = err.raw_os_error().unwrap_or(-1);
                    let _ = report_write.write_all(&errno.to_le_bytes());
                    posix::_exit(127);
                }
            }
        };

        // Our copies of the child-side descriptors are no longer needed;
        // descriptors shared with other stages stay open through their own
        // Arc clones.
        drop(child_ends);

        drop(report_write);
        match read_exec_report(&mut report_read)? {
            None => Ok(Process::new(pid)),
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    // Wire the standard streams, switch directories, and exec.  Only
    // returns if something went wrong; the error travels back to the
    // parent as an errno over the report pipe.
    fn enter_child(
        exec: impl FnOnce() -> io::Result<()>,
        child_ends: (ChildEnd, ChildEnd, ChildEnd),
        cwd: Option<&OsStr>,
    ) -> io::Error {
        if let Some(cwd) = cwd
            && let Err(err) = std::env::set_current_dir(cwd)
        {
            return err;
        }
        let (stdin, stdout, stderr) = &child_ends;
        for (end, fd) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
            if let Err(err) = install_fd(end, fd) {
                return err;
            }
        }
        if let Err(err) = posix::restore_signal_defaults() {
            return err;
        }
        match exec() {
            Ok(()) => unreachable!("exec returned without an error"),
            Err(err) => err,
        }
    }

    fn install_fd(end: &ChildEnd, target: i32) -> io::Result<()> {
        let Some(file) = end else { return Ok(()) };
        if file.as_raw_fd() == target {
            // Already sitting on the right number; let it survive exec.
            posix::set_cloexec(file, false)
        } else {
            // The copy made by dup2 is not close-on-exec.
            posix::dup2(file.as_raw_fd(), target)
        }
    }

    // The child reports an exec failure as its errno over a dedicated
    // close-on-exec pipe; a successful exec closes the pipe without
    // writing anything.
    fn read_exec_report(pipe: &mut File) -> io::Result<Option<i32>> {
        let mut report = Vec::new();
        pipe.read_to_end(&mut report)?;
        match <[u8; 4]>::try_from(report.as_slice()) {
            Ok(errno) => Ok(Some(i32::from_le_bytes(errno))),
            Err(_) if report.is_empty() => Ok(None),
            Err(_) => Err(io::Error::other("truncated exec report from child")),
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use crate::win32;
    use std::collections::BTreeMap;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::os::windows::io::{AsRawHandle, RawHandle};

    /// Create a pipe; both ends are non-inheritable until a spawn marks the
    /// child's end for inheritance.
    pub fn make_pipe() -> io::Result<(File, File)> {
        win32::make_pipe()
    }

    /// Duplicate one of the parent's standard streams into an owned handle.
    pub fn dup_inherited(fd: i32) -> io::Result<File> {
        let which = match fd {
            0 => win32::STD_INPUT,
            1 => win32::STD_OUTPUT,
            2 => win32::STD_ERROR,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "only the standard descriptors can be duplicated",
                ));
            }
        };
        win32::dup_std_stream(which)
    }

    pub(crate) fn os_start(
        executable: &OsStr,
        argv: &[OsString],
        env: Option<&[(OsString, OsString)]>,
        cwd: Option<&OsStr>,
        child_ends: (ChildEnd, ChildEnd, ChildEnd),
    ) -> io::Result<Process> {
        let (stdin, stdout, stderr) = &child_ends;
        let streams = [
            inheritable_handle(stdin, win32::STD_INPUT)?,
            inheritable_handle(stdout, win32::STD_OUTPUT)?,
            inheritable_handle(stderr, win32::STD_ERROR)?,
        ];
        let cmdline = build_cmdline(argv)?;
        let block = env.map(env_block);
        let (handle, pid) =
            win32::spawn_process(executable, &cmdline, block.as_deref(), cwd, streams)?;
        drop(child_ends);
        Ok(Process::new(pid, handle))
    }

    fn inheritable_handle(end: &ChildEnd, fallback: u32) -> io::Result<RawHandle> {
        match end {
            Some(file) => {
                win32::set_inheritable(file, true)?;
                Ok(file.as_raw_handle())
            }
            None => win32::std_stream_handle(fallback),
        }
    }

    // CreateProcess takes a NUL-separated block.  Keys compare
    // case-insensitively, later duplicates override earlier ones, and the
    // block is conventionally sorted by folded key.
    fn env_block(env: &[(OsString, OsString)]) -> Vec<u16> {
        fn fold_key(key: &OsStr) -> Vec<u16> {
            key.encode_wide()
                .map(|c| {
                    if c < 128 {
                        (c as u8).to_ascii_uppercase() as u16
                    } else {
                        c
                    }
                })
                .collect()
        }

        let mut merged: BTreeMap<Vec<u16>, (&OsString, &OsString)> = BTreeMap::new();
        for (key, value) in env {
            merged.insert(fold_key(key), (key, value));
        }
        let mut block = Vec::new();
        for (key, value) in merged.values() {
            block.extend(key.encode_wide());
            block.push('=' as u16);
            block.extend(value.encode_wide());
            block.push(0);
        }
        block.push(0);
        block
    }

    // Build one command line from the argv, quoted so that the C runtime's
    // argument parsing reverses it exactly.
    fn build_cmdline(argv: &[OsString]) -> io::Result<OsString> {
        let mut line: Vec<u16> = Vec::new();
        for (i, arg) in argv.iter().enumerate() {
            if arg.encode_wide().any(|c| c == 0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "NUL in argument",
                ));
            }
            if i > 0 {
                line.push(b' ' as u16);
            }
            quote_arg(arg, &mut line);
        }
        Ok(OsString::from_wide(&line))
    }

    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    fn push_backslashes(line: &mut Vec<u16>, count: usize) {
        line.extend(std::iter::repeat(BACKSLASH).take(count));
    }

    fn quote_arg(arg: &OsStr, line: &mut Vec<u16>) {
        let plain = !arg.is_empty()
            && !arg.encode_wide().any(|c| {
                c == b' ' as u16
                    || c == b'\t' as u16
                    || c == b'\n' as u16
                    || c == 0x0b
                    || c == QUOTE
            });
        if plain {
            line.extend(arg.encode_wide());
            return;
        }

        line.push(QUOTE);
        let mut pending_backslashes = 0;
        for c in arg.encode_wide() {
            match c {
                BACKSLASH => pending_backslashes += 1,
                QUOTE => {
                    // Backslashes in front of a quote must be doubled,
                    // plus one more to escape the quote itself.
                    push_backslashes(line, pending_backslashes * 2 + 1);
                    line.push(QUOTE);
                    pending_backslashes = 0;
                }
                c => {
                    push_backslashes(line, pending_backslashes);
                    line.push(c);
                    pending_backslashes = 0;
                }
            }
        }
        // Trailing backslashes precede the closing quote, so they double
        // as well.
        push_backslashes(line, pending_backslashes * 2);
        line.push(QUOTE);
    }
}
