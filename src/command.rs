#[cfg(unix)]
mod os {
    pub const SHELL: [&str; 2] = ["sh", "-c"];
}

#[cfg(windows)]
mod os {
    pub const SHELL: [&str; 2] = ["cmd.exe", "/c"];
}

use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};
use crate::pipeline::Binding;
use crate::process::{ExitStatus, Process};
use crate::spawn::{self, ChildEnd};

/// The source of a command: a command line to be split on whitespace (or
/// handed to the shell), or an argument vector used as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdSource {
    /// A command line string.
    Line(String),
    /// An argument vector.
    Argv(Vec<String>),
}

impl From<&str> for CmdSource {
    fn from(s: &str) -> CmdSource {
        CmdSource::Line(s.to_owned())
    }
}

impl From<String> for CmdSource {
    fn from(s: String) -> CmdSource {
        CmdSource::Line(s)
    }
}

impl From<Vec<String>> for CmdSource {
    fn from(argv: Vec<String>) -> CmdSource {
        CmdSource::Argv(argv)
    }
}

impl From<&[&str]> for CmdSource {
    fn from(argv: &[&str]) -> CmdSource {
        CmdSource::Argv(argv.iter().map(|a| (*a).to_owned()).collect())
    }
}

impl From<Vec<&str>> for CmdSource {
    fn from(argv: Vec<&str>) -> CmdSource {
        CmdSource::Argv(argv.into_iter().map(str::to_owned).collect())
    }
}

enum Phase {
    Configured,
    Running(Process),
    Skipped,
}

struct Shared {
    phase: Mutex<Phase>,
    cond: Condvar,
    bindings: Mutex<BindingSet>,
    background: bool,
}

#[derive(Default)]
struct BindingSet {
    stdin: Binding,
    stdout: Binding,
    stderr: Binding,
}

/// A single external command: its argument vector, environment, working
/// directory and stream bindings, plus the child process once started.
///
/// `Command` can be used on its own, but is more commonly obtained from
/// [`Pipeline::commands`], which creates one per stage of a parsed command
/// line.  The handle is cheaply cloneable, and clones share the run state:
/// the pipeline driver records the spawned child in the same `Command` the
/// host is polling.
///
/// A command moves through three phases: *configured* (no OS resources),
/// *running* (child spawned), and *finished* (exit status available).  A
/// command skipped by `&&`/`||` short-circuiting never leaves *configured*;
/// its exit status stays `None`.
///
/// [`Pipeline::commands`]: struct.Pipeline.html#method.commands
#[derive(Clone)]
pub struct Command {
    argv: Vec<String>,
    shell: bool,
    cwd: Option<PathBuf>,
    env: Option<Vec<(OsString, OsString)>>,
    shared: Arc<Shared>,
}

impl Command {
    /// Creates a command from a command line (split on whitespace) or an
    /// argument vector (used as-is).
    pub fn new(src: impl Into<CmdSource>) -> Command {
        let argv = match src.into() {
            CmdSource::Line(line) => line.split_whitespace().map(str::to_owned).collect(),
            CmdSource::Argv(argv) => argv,
        };
        Command::from_argv(argv, false, false)
    }

    /// Creates a command that passes `line` to the OS shell verbatim
    /// (`sh -c` on Unix, `cmd.exe /c` on Windows).
    pub fn shell(line: impl AsRef<str>) -> Command {
        Command::from_argv(vec![line.as_ref().to_owned()], true, false)
    }

    pub(crate) fn from_argv(argv: Vec<String>, shell: bool, background: bool) -> Command {
        Command {
            argv,
            shell,
            cwd: None,
            env: None,
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Configured),
                cond: Condvar::new(),
                bindings: Mutex::new(BindingSet::default()),
                background,
            }),
        }
    }

    /// The command's arguments, as configured.
    pub fn args(&self) -> &[String] {
        &self.argv
    }

    /// Sets the working directory of the child.
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Command {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets an environment variable in the child.
    ///
    /// Other variables are inherited from the current process; call
    /// [`env_clear`](Self::env_clear) first to replace the environment
    /// entirely.  If the same variable is set more than once, the last
    /// value wins.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Command {
        self.ensure_env()
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Clears the environment of the child, so that it no longer inherits
    /// the variables of the current process.
    pub fn env_clear(mut self) -> Command {
        self.env = Some(vec![]);
        self
    }

    fn ensure_env(&mut self) -> &mut Vec<(OsString, OsString)> {
        self.env.get_or_insert_with(|| env::vars_os().collect())
    }

    /// Binds the child's standard input.
    ///
    /// Literal input data cannot be bound here; route it through the
    /// pipeline's `input` instead.
    pub fn stdin(self, binding: impl Into<Binding>) -> Command {
        self.shared.bindings.lock().unwrap().stdin = binding.into();
        self
    }

    /// Binds the child's standard output.
    pub fn stdout(self, binding: impl Into<Binding>) -> Command {
        self.shared.bindings.lock().unwrap().stdout = binding.into();
        self
    }

    /// Binds the child's standard error.
    pub fn stderr(self, binding: impl Into<Binding>) -> Command {
        self.shared.bindings.lock().unwrap().stderr = binding.into();
        self
    }

    pub(crate) fn set_cwd_env(
        &mut self,
        cwd: &Option<PathBuf>,
        env: &Option<Vec<(OsString, OsString)>>,
    ) {
        self.cwd = cwd.clone();
        self.env = env.clone();
    }

    pub(crate) fn cwd_path(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub(crate) fn is_background(&self) -> bool {
        self.shared.background
    }

    /// Resolves the executable and runs the command with its configured
    /// bindings, without waiting for it to finish.
    pub fn run(&self) -> Result<()> {
        let bindings = std::mem::take(&mut *self.shared.bindings.lock().unwrap());
        let stdin = crate::pipeline::stdin_end(bindings.stdin)?;
        let stdout = crate::pipeline::output_end(bindings.stdout, "stdout")?;
        let stderr = crate::pipeline::output_end(bindings.stderr, "stderr")?;
        self.run_wired(stdin, stdout, stderr)?;
        Ok(())
    }

    /// Spawns the child with fully resolved stream ends.  Used both by
    /// [`run`](Self::run) and by the pipeline executor, which supplies
    /// pipe ends and redirection targets of its own.
    pub(crate) fn run_wired(
        &self,
        stdin: ChildEnd,
        stdout: ChildEnd,
        stderr: ChildEnd,
    ) -> Result<Process> {
        let (executable, argv) = match self.resolve() {
            Ok(resolved) => resolved,
            Err(err) => {
                self.mark_skipped();
                return Err(err);
            }
        };
        debug!("spawning {:?} as {:?}", self.argv, executable);
        let cwd = self.cwd.as_ref().map(|p| p.as_os_str().to_owned());
        let process = spawn::spawn(
            &executable,
            &argv,
            self.env.as_deref(),
            cwd.as_deref(),
            stdin,
            stdout,
            stderr,
        );
        match process {
            Ok(process) => {
                let mut phase = self.shared.phase.lock().unwrap();
                *phase = Phase::Running(process.clone());
                self.shared.cond.notify_all();
                Ok(process)
            }
            Err(err) => {
                self.mark_skipped();
                Err(err.into())
            }
        }
    }

    // Resolve the executable and final argv.
    fn resolve(&self) -> Result<(OsString, Vec<OsString>)> {
        if self.shell {
            let mut argv: Vec<OsString> = os::SHELL.iter().map(OsString::from).collect();
            argv.extend(self.argv.iter().map(OsString::from));
            let exe = resolve_executable(os::SHELL[0], self.cwd.as_deref())?;
            return Ok((exe, argv));
        }
        let name = self
            .argv
            .first()
            .ok_or_else(|| Error::Binding("empty command".into()))?;
        let exe = resolve_executable(name, self.cwd.as_deref())?;
        #[cfg(windows)]
        if let Some(interpreter) = script_interpreter(&exe)? {
            let mut argv: Vec<OsString> = vec![interpreter.clone()];
            argv.push(exe.clone());
            argv.extend(self.argv.iter().skip(1).map(OsString::from));
            return Ok((interpreter, argv));
        }
        let argv = self.argv.iter().map(OsString::from).collect();
        Ok((exe, argv))
    }

    pub(crate) fn mark_skipped(&self) {
        let mut phase = self.shared.phase.lock().unwrap();
        if matches!(*phase, Phase::Configured) {
            *phase = Phase::Skipped;
        }
        self.shared.cond.notify_all();
    }

    /// The child process handle, once the command has been started.
    pub fn process(&self) -> Option<Process> {
        match &*self.shared.phase.lock().unwrap() {
            Phase::Running(process) => Some(process.clone()),
            _ => None,
        }
    }

    /// The exit status, if the child has been started and has finished.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.process().and_then(|p| p.exit_status())
    }

    /// Checks without blocking whether the child has finished, reaping it
    /// if so.
    pub fn poll(&self) -> Option<ExitStatus> {
        self.process().and_then(|p| p.poll())
    }

    /// Waits for the child to finish and returns its exit status.
    ///
    /// If the command was skipped, returns an undetermined status.  If it
    /// has not been started yet (e.g. an async pipeline driver has not
    /// reached it), blocks until it is.
    pub fn wait(&self) -> Result<ExitStatus> {
        match self.wait_deadline(None)? {
            Some(status) => Ok(status),
            None => unreachable!("deadline-less wait returned None"),
        }
    }

    /// Like [`wait`](Self::wait), with a timeout.  Returns `Ok(None)` on
    /// expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<ExitStatus>> {
        self.wait_deadline(Some(Instant::now() + timeout))
    }

    pub(crate) fn wait_deadline(&self, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
        let mut phase = self.shared.phase.lock().unwrap();
        loop {
            match &*phase {
                Phase::Running(process) => {
                    let process = process.clone();
                    drop(phase);
                    return match deadline {
                        None => Ok(Some(process.wait()?)),
                        Some(deadline) => {
                            let now = Instant::now();
                            let remaining = deadline.saturating_duration_since(now);
                            Ok(process.wait_timeout(remaining)?)
                        }
                    };
                }
                Phase::Skipped => return Ok(Some(ExitStatus::undetermined())),
                Phase::Configured => match deadline {
                    None => phase = self.shared.cond.wait(phase).unwrap(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(None);
                        }
                        phase = self
                            .shared
                            .cond
                            .wait_timeout(phase, deadline - now)
                            .unwrap()
                            .0;
                    }
                },
            }
        }
    }

    /// Terminates the child if it is running.
    pub fn terminate(&self) -> Result<()> {
        if let Some(process) = self.process() {
            process.terminate()?;
        }
        Ok(())
    }

    /// Kills the child if it is running.
    pub fn kill(&self) -> Result<()> {
        if let Some(process) = self.process() {
            process.kill()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command {{ {:?} }}", self.argv.join(" "))
    }
}

/// Resolve a command name to an executable path.
///
/// Names containing a path separator are taken relative to `cwd` (or the
/// current directory); bare names are searched for in `PATH`.  On Windows
/// the extensions listed in `PATHEXT` are tried as well.
fn resolve_executable(name: &str, cwd: Option<&Path>) -> Result<OsString> {
    let not_found = || Error::NotFound(name.to_owned());
    let path = Path::new(name);
    if path.components().count() > 1 {
        let full = match cwd {
            Some(cwd) if path.is_relative() => cwd.join(path),
            _ => path.to_owned(),
        };
        return check_executable(&full).ok_or_else(not_found);
    }
    let search_path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search_path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        if let Some(found) = check_executable(&dir.join(name)) {
            return Ok(found);
        }
    }
    Err(not_found())
}

#[cfg(unix)]
fn check_executable(candidate: &Path) -> Option<OsString> {
    use std::os::unix::fs::PermissionsExt;
    let meta = candidate.metadata().ok()?;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        Some(candidate.as_os_str().to_owned())
    } else {
        None
    }
}

#[cfg(windows)]
fn check_executable(candidate: &Path) -> Option<OsString> {
    if candidate.is_file() {
        return Some(candidate.as_os_str().to_owned());
    }
    let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_owned());
    for ext in pathext.split(';').filter(|e| !e.is_empty()) {
        let mut with_ext = candidate.as_os_str().to_owned();
        with_ext.push(ext);
        if Path::new(&with_ext).is_file() {
            return Some(with_ext);
        }
    }
    None
}

/// For `.py`/`.pyw` scripts, the interpreter to run them with: the `py`
/// launcher that ships with Python for Windows.
#[cfg(windows)]
fn script_interpreter(exe: &OsStr) -> Result<Option<OsString>> {
    let path = Path::new(exe);
    let launcher = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("py") => "py",
        Some(ext) if ext.eq_ignore_ascii_case("pyw") => "pyw",
        _ => return Ok(None),
    };
    match resolve_executable(launcher, None) {
        Ok(found) => Ok(Some(found)),
        Err(_) => Err(Error::NotFound(format!(
            "{} (no {} launcher for it)",
            path.display(),
            launcher
        ))),
    }
}
