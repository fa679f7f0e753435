use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::capture::Capture;
use crate::command::{CmdSource, Command};
use crate::error::{Error, Result};
use crate::feeder::Feeder;
use crate::parse::{
    CommandLine, Connector, Node, Redirect, RedirectOp, RedirectTarget, parse_command_line,
};
use crate::process::{ExitStatus, Process};
use crate::spawn::{self, ChildEnd};

/// What to connect a child's standard stream to.
///
/// The default is [`Inherit`](Binding::Inherit).  `Capture`, `File` and
/// `Feeder` values convert into `Binding` implicitly, so
/// `pipeline.stdout(cap.clone())` works without naming the enum.
#[derive(Debug, Default)]
#[non_exhaustive]
pub enum Binding {
    /// Inherit the stream from the parent.
    #[default]
    Inherit,
    /// Collect an output stream into a [`Capture`].  Not valid for stdin.
    Capture(Capture),
    /// Feed stdin from a [`Feeder`].  Not valid for output streams.
    Feeder(Feeder),
    /// Connect the stream to an open file.
    File(File),
    /// Connect the stream to the null device.
    Null,
}

impl From<Capture> for Binding {
    fn from(cap: Capture) -> Binding {
        Binding::Capture(cap)
    }
}

impl From<&Capture> for Binding {
    fn from(cap: &Capture) -> Binding {
        Binding::Capture(cap.clone())
    }
}

impl From<Feeder> for Binding {
    fn from(feeder: Feeder) -> Binding {
        Binding::Feeder(feeder)
    }
}

impl From<&Feeder> for Binding {
    fn from(feeder: &Feeder) -> Binding {
        Binding::Feeder(feeder.clone())
    }
}

impl From<File> for Binding {
    fn from(file: File) -> Binding {
        Binding::File(file)
    }
}

/// Input for the first stage of a pipeline: either literal bytes, written
/// by a background thread, or a [`Feeder`] the host feeds on demand.
#[derive(Debug)]
pub enum Input {
    /// Literal bytes, written into the child's stdin and then closed.
    Data(Vec<u8>),
    /// A host-controlled feeder.
    Feeder(Feeder),
}

impl From<&str> for Input {
    fn from(s: &str) -> Input {
        Input::Data(s.as_bytes().to_vec())
    }
}

impl From<String> for Input {
    fn from(s: String) -> Input {
        Input::Data(s.into_bytes())
    }
}

impl From<&[u8]> for Input {
    fn from(data: &[u8]) -> Input {
        Input::Data(data.to_vec())
    }
}

impl From<Vec<u8>> for Input {
    fn from(data: Vec<u8>) -> Input {
        Input::Data(data)
    }
}

impl From<Feeder> for Input {
    fn from(feeder: Feeder) -> Input {
        Input::Feeder(feeder)
    }
}

impl From<&Feeder> for Input {
    fn from(feeder: &Feeder) -> Input {
        Input::Feeder(feeder.clone())
    }
}

// What a stage's standard stream is wired to while walking the tree.
// Capture stays symbolic until a stage is spawned, at which point it turns
// into a fresh pipe whose read end is handed to the capture.
#[derive(Clone)]
enum Wire {
    Inherit,
    File(Arc<File>),
    Capture(Capture),
}

#[derive(Clone)]
struct Wires {
    stdin: Wire,
    stdout: Wire,
    stderr: Wire,
}

// State shared between the host, the async driver, and background part
// threads.
struct ExecEnv {
    commands: Vec<Command>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    error: Mutex<Option<Error>>,
}

/// A shell-like command line, parsed and executed by the library.
///
/// `Pipeline` is both the builder and the handle.  Configure the sources of
/// the command line and the bindings of the outer streams, then call
/// [`run`](Self::run) (synchronous) or [`run_async`](Self::run_async); both
/// return the pipeline with [`commands`](Self::commands) fully populated,
/// one [`Command`] per stage in source order.
///
/// The command-line language supports `|` and `|&`, `;`, `&&` and `||`,
/// parenthesised groups, redirections (`>`, `>>`, `<`, `2>&1`, fd swaps),
/// and background execution with `&`.  See the crate documentation for the
/// exact grammar.
///
/// # Examples
///
/// ```no_run
/// # use shpipe::*;
/// # fn dummy() -> shpipe::Result<()> {
/// let out = Capture::new();
/// let p = Pipeline::new("cat unsorted.txt | sort | uniq -c")
///     .stdout(out.clone())
///     .run()?;
/// assert!(p.exit_status().success());
/// out.close(true);
/// println!("{}", out.text());
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct Pipeline {
    source: CmdSource,
    shell: bool,
    stdin_binding: Binding,
    stdout_binding: Binding,
    stderr_binding: Binding,
    input: Option<Input>,
    cwd: Option<PathBuf>,
    env: Option<Vec<(OsString, OsString)>>,
    stdout_capture: Option<Capture>,
    stderr_capture: Option<Capture>,
    state: Option<Arc<ExecEnv>>,
}

impl Pipeline {
    /// Creates a pipeline from a command line (parsed by the library's
    /// mini-language) or from an argument vector (a single command, used
    /// as-is).
    pub fn new(src: impl Into<CmdSource>) -> Pipeline {
        Pipeline {
            source: src.into(),
            shell: false,
            stdin_binding: Binding::Inherit,
            stdout_binding: Binding::Inherit,
            stderr_binding: Binding::Inherit,
            input: None,
            cwd: None,
            env: None,
            stdout_capture: None,
            stderr_capture: None,
            state: None,
        }
    }

    /// Creates a pipeline that hands `line` verbatim to the OS shell
    /// instead of parsing it.
    pub fn shell(line: impl AsRef<str>) -> Pipeline {
        let mut pipeline = Pipeline::new(line.as_ref());
        pipeline.shell = true;
        pipeline
    }

    /// Binds the standard input of the pipeline's first stage(s).
    pub fn stdin(mut self, binding: impl Into<Binding>) -> Pipeline {
        self.stdin_binding = binding.into();
        self
    }

    /// Binds the standard output of stages whose output is neither piped
    /// nor redirected.
    pub fn stdout(mut self, binding: impl Into<Binding>) -> Pipeline {
        let binding = binding.into();
        if let Binding::Capture(cap) = &binding {
            self.stdout_capture = Some(cap.clone());
        }
        self.stdout_binding = binding;
        self
    }

    /// Binds the standard error of stages that do not redirect it.
    pub fn stderr(mut self, binding: impl Into<Binding>) -> Pipeline {
        let binding = binding.into();
        if let Binding::Capture(cap) = &binding {
            self.stderr_capture = Some(cap.clone());
        }
        self.stderr_binding = binding;
        self
    }

    /// Supplies input for the first stage: literal bytes (fed by a writer
    /// thread through a pipe) or a [`Feeder`].
    pub fn input(mut self, input: impl Into<Input>) -> Pipeline {
        self.input = Some(input.into());
        self
    }

    /// Sets the working directory for all commands.  Redirection targets
    /// with relative paths are opened relative to it as well.
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Pipeline {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets an environment variable for all commands; inherited variables
    /// are kept unless [`env_clear`](Self::env_clear) was called.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Pipeline {
        self.env
            .get_or_insert_with(|| std::env::vars_os().collect())
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Clears the inherited environment for all commands.
    pub fn env_clear(mut self) -> Pipeline {
        self.env = Some(vec![]);
        self
    }

    /// Parses, validates, spawns and runs the command line to completion,
    /// background (`&`) parts included.
    ///
    /// All parse errors, binding conflicts and command-resolution failures
    /// surface here.  On success the pipeline is returned with every
    /// command's exit status available through
    /// [`exit_statuses`](Self::exit_statuses).  Use
    /// [`run_async`](Self::run_async) to regain control while children are
    /// still running.
    pub fn run(mut self) -> Result<Pipeline> {
        let (env, tree, wires) = self.prepare()?;
        if let Err(err) = execute(&env, tree, wires, PipeEnds::default(), 0) {
            // Leave no command in the configured state, or a later wait()
            // would block on it forever.  Background parts that are still
            // starting up mark their own commands.
            mark_unspawned_skipped(&env);
            return Err(err);
        }
        join_threads(&env);
        if let Some(err) = env.error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self)
    }

    /// Like [`run`](Self::run), but returns as soon as the commands are
    /// created and the driver thread has been started.
    ///
    /// [`commands`](Self::commands) is fully populated when this returns;
    /// the driver spawns children into the existing [`Command`] handles as
    /// it walks the tree.  Errors encountered by the driver are reported by
    /// [`wait`](Self::wait).
    pub fn run_async(mut self) -> Result<Pipeline> {
        let (env, tree, wires) = self.prepare()?;
        let driver_env = Arc::clone(&env);
        let driver = thread::spawn(move || {
            if let Err(err) = execute(&driver_env, tree, wires, PipeEnds::default(), 0) {
                mark_unspawned_skipped(&driver_env);
                record_error(&driver_env, err);
            }
        });
        env.threads.lock().unwrap().push(driver);
        Ok(self)
    }

    fn prepare(&mut self) -> Result<(Arc<ExecEnv>, CommandLine, Wires)> {
        let tree = match (&self.source, self.shell) {
            (CmdSource::Line(line), false) => parse_command_line(line, true)?,
            (CmdSource::Line(line), true) => CommandLine::Cmd(Node {
                command: vec![line.clone()],
                redirects: vec![],
            }),
            (CmdSource::Argv(argv), _) => CommandLine::Cmd(Node {
                command: argv.clone(),
                redirects: vec![],
            }),
        };
        self.check_conflicts(&tree)?;

        let mut commands = Vec::with_capacity(tree.leaf_count());
        self.create_commands(&tree, false, &mut commands);
        let env = Arc::new(ExecEnv {
            commands,
            threads: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        });
        self.state = Some(Arc::clone(&env));

        let stdin = self.stdin_wire(&env)?;
        let stdout = output_wire(std::mem::take(&mut self.stdout_binding), "stdout")?;
        let stderr = output_wire(std::mem::take(&mut self.stderr_binding), "stderr")?;
        let wires = Wires {
            stdin,
            stdout,
            stderr,
        };
        debug!("prepared pipeline with {} commands", env.commands.len());
        Ok((env, tree, wires))
    }

    fn create_commands(&self, tree: &CommandLine, background: bool, out: &mut Vec<Command>) {
        match tree {
            CommandLine::Cmd(node) => {
                let mut command = Command::from_argv(node.command.clone(), self.shell, background);
                command.set_cwd_env(&self.cwd, &self.env);
                out.push(command);
            }
            CommandLine::Group(body, _) => self.create_commands(body, background, out),
            CommandLine::Connection {
                op: Connector::BgSeq,
                left,
                right,
            } => {
                self.create_commands(left, true, out);
                self.create_commands(right, background, out);
            }
            CommandLine::Connection { left, right, .. } => {
                self.create_commands(left, background, out);
                self.create_commands(right, background, out);
            }
            CommandLine::Background(body) => self.create_commands(body, true, out),
        }
    }

    fn stdin_wire(&mut self, env: &Arc<ExecEnv>) -> Result<Wire> {
        if let Some(input) = self.input.take() {
            return match input {
                Input::Data(data) => {
                    let (read, write) = spawn::make_pipe()?;
                    let writer = thread::spawn(move || {
                        let mut write = write;
                        // A child that exits without consuming everything
                        // closes the pipe; the resulting BrokenPipe is not
                        // an error worth surfacing.
                        if let Err(err) = write.write_all(&data) {
                            trace!("input writer stopped: {}", err);
                        }
                    });
                    env.threads.lock().unwrap().push(writer);
                    Ok(Wire::File(Arc::new(read)))
                }
                Input::Feeder(feeder) => Ok(Wire::File(Arc::new(feeder.reader()?))),
            };
        }
        match std::mem::take(&mut self.stdin_binding) {
            Binding::Inherit => Ok(Wire::Inherit),
            Binding::File(file) => Ok(Wire::File(Arc::new(file))),
            Binding::Feeder(feeder) => Ok(Wire::File(Arc::new(feeder.reader()?))),
            Binding::Null => Ok(Wire::File(Arc::new(open_null(false)?))),
            Binding::Capture(_) => Err(Error::Binding("a Capture cannot supply stdin".into())),
        }
    }

    // A single top-level command that redirects a stream to a file while
    // the caller binds the same stream would leave the binding without any
    // data; reject the combination before spawning anything.
    fn check_conflicts(&self, tree: &CommandLine) -> Result<()> {
        let Some(node) = tree.node() else {
            return Ok(());
        };
        let bound = [
            self.input.is_some() || !matches!(self.stdin_binding, Binding::Inherit),
            !matches!(self.stdout_binding, Binding::Inherit),
            !matches!(self.stderr_binding, Binding::Inherit),
        ];
        for redirect in &node.redirects {
            if (0..=2).contains(&redirect.fd)
                && bound[redirect.fd as usize]
                && matches!(redirect.target, RedirectTarget::File(_))
            {
                return Err(Error::Binding(format!(
                    "fd {} is redirected in the command line but also bound by the caller",
                    redirect.fd
                )));
            }
        }
        Ok(())
    }

    /// The commands of the pipeline, in source order.  Empty before
    /// [`run`](Self::run).
    pub fn commands(&self) -> Vec<Command> {
        match &self.state {
            Some(env) => env.commands.clone(),
            None => Vec::new(),
        }
    }

    /// The child process handles, in source order; `None` for commands not
    /// (yet) started.
    pub fn processes(&self) -> Vec<Option<Process>> {
        self.commands().iter().map(Command::process).collect()
    }

    /// The exit statuses, in source order; `None` for commands still
    /// running, not yet started, or skipped by `&&`/`||`.
    pub fn exit_statuses(&self) -> Vec<Option<ExitStatus>> {
        self.commands().iter().map(Command::exit_status).collect()
    }

    /// The aggregate exit status: that of the last command that has one,
    /// or success when none has finished.
    pub fn exit_status(&self) -> ExitStatus {
        self.exit_statuses()
            .into_iter()
            .rev()
            .flatten()
            .next()
            .unwrap_or(ExitStatus::from_raw(0))
    }

    /// The capture bound to stdout, if any.
    pub fn stdout_capture(&self) -> Option<Capture> {
        self.stdout_capture.clone()
    }

    /// The capture bound to stderr, if any.
    pub fn stderr_capture(&self) -> Option<Capture> {
        self.stderr_capture.clone()
    }

    /// Waits for every child, including background ones, and for the
    /// pipeline's helper threads, then reports any error the async driver
    /// encountered.  Returns the aggregate exit status.
    pub fn wait(&self) -> Result<ExitStatus> {
        self.wait_inner(None)
    }

    /// Like [`wait`](Self::wait) with a time limit.
    ///
    /// On expiry, fails with [`Error::Timeout`]; still-running children are
    /// left running and their exit statuses stay `None`.  A later wait can
    /// pick up where this one left off.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ExitStatus> {
        self.wait_inner(Some(Instant::now() + timeout))
    }

    fn wait_inner(&self, deadline: Option<Instant>) -> Result<ExitStatus> {
        let Some(env) = &self.state else {
            return Ok(ExitStatus::from_raw(0));
        };
        for command in &env.commands {
            if command.wait_deadline(deadline)?.is_none() {
                return Err(Error::Timeout);
            }
        }
        join_threads(env);
        if let Some(err) = env.error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.exit_status())
    }

    /// Waits for all foreground children to finish.  Background (`&`)
    /// children are left running; they remain reachable through
    /// [`commands`](Self::commands).
    pub fn close(&self) -> Result<()> {
        let Some(env) = &self.state else {
            return Ok(());
        };
        for command in &env.commands {
            if !command.is_background() {
                command.wait_deadline(None)?;
            }
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("source", &self.source)
            .field("shell", &self.shell)
            .field("started", &self.state.is_some())
            .finish()
    }
}

fn join_threads(env: &Arc<ExecEnv>) {
    // Part threads may spawn further threads; drain until quiescent.
    loop {
        let handles = std::mem::take(&mut *env.threads.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn record_error(env: &Arc<ExecEnv>, err: Error) {
    let mut slot = env.error.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn mark_unspawned_skipped(env: &Arc<ExecEnv>) {
    for command in &env.commands {
        command.mark_skipped();
    }
}

fn skip_range(env: &Arc<ExecEnv>, lo: usize, hi: usize) {
    for command in &env.commands[lo..hi] {
        command.mark_skipped();
    }
}

fn terminate_range(env: &Arc<ExecEnv>, lo: usize, hi: usize) {
    for command in &env.commands[lo..hi] {
        let _ = command.terminate();
        command.mark_skipped();
    }
}

// Pipe connections for the stage a subtree hands a stream to.  They are
// installed after the stage's own redirections, so a descriptor-duplication
// redirect of a piped stream is overridden by the pipe; combining a *file*
// redirect with piping was already rejected by the parser.
#[derive(Clone, Default)]
struct PipeEnds {
    stdin: Option<Arc<File>>,
    stdout: Option<Arc<File>>,
    stderr: Option<Arc<File>>,
}

// Walk the tree, spawning children and enforcing operator semantics.
// Blocks until the subtree completes and returns its aggregate exit status
// (that of the last stage of a pipe, or of the last part executed).
// `idx` is the index of the subtree's first command in `env.commands`.
fn execute(
    env: &Arc<ExecEnv>,
    tree: CommandLine,
    wires: Wires,
    pipes: PipeEnds,
    idx: usize,
) -> Result<ExitStatus> {
    match tree {
        CommandLine::Cmd(node) => {
            let command = env.commands[idx].clone();
            let ends = resolve_redirects(&node.redirects, &wires, &pipes, command.cwd_path())?;
            // Drop our pipe ends before waiting, so that a downstream
            // stage sees EOF as soon as this child exits.
            drop(pipes);
            let process = command.run_wired(ends.0, ends.1, ends.2)?;
            trace!("stage {} spawned as pid {}", idx, process.pid());
            Ok(process.wait()?)
        }
        CommandLine::Group(body, redirects) => {
            let wires = group_wires(wires, &redirects, pipes, cwd_of(env, idx))?;
            execute(env, *body, wires, PipeEnds::default(), idx)
        }
        CommandLine::Connection {
            op: op @ (Connector::Pipe | Connector::PipeBoth),
            left,
            right,
        } => {
            let (read, write) = spawn::make_pipe()?;
            let write = Arc::new(write);
            let lcount = left.leaf_count();
            let lpipes = PipeEnds {
                stdin: pipes.stdin,
                stdout: Some(Arc::clone(&write)),
                stderr: match op {
                    Connector::PipeBoth => Some(write),
                    _ => None,
                },
            };
            let rpipes = PipeEnds {
                stdin: Some(Arc::new(read)),
                stdout: pipes.stdout,
                stderr: pipes.stderr,
            };
            let left_env = Arc::clone(env);
            let left_tree = *left;
            let lwires = wires.clone();
            let left_thread =
                thread::spawn(move || execute(&left_env, left_tree, lwires, lpipes, idx));
            let right_result = execute(env, *right, wires, rpipes, idx + lcount);
            if right_result.is_err() {
                // The right side failed to start; the left side would block
                // forever writing into the dead pipe.
                terminate_range(env, idx, idx + lcount);
            }
            let left_result = match left_thread.join() {
                Ok(result) => result,
                Err(_) => Err(Error::Io(io::Error::other("pipeline thread panicked"))),
            };
            let status = right_result?;
            left_result?;
            Ok(status)
        }
        CommandLine::Connection {
            op: Connector::Seq,
            left,
            right,
        } => {
            let lcount = left.leaf_count();
            execute(env, *left, wires.clone(), PipeEnds::default(), idx)?;
            execute(env, *right, wires, PipeEnds::default(), idx + lcount)
        }
        CommandLine::Connection {
            op: Connector::And,
            left,
            right,
        } => {
            let lcount = left.leaf_count();
            let rcount = right.leaf_count();
            let status = execute(env, *left, wires.clone(), PipeEnds::default(), idx)?;
            if status.success() {
                execute(env, *right, wires, PipeEnds::default(), idx + lcount)
            } else {
                skip_range(env, idx + lcount, idx + lcount + rcount);
                Ok(status)
            }
        }
        CommandLine::Connection {
            op: Connector::Or,
            left,
            right,
        } => {
            let lcount = left.leaf_count();
            let rcount = right.leaf_count();
            let status = execute(env, *left, wires.clone(), PipeEnds::default(), idx)?;
            if !status.success() {
                execute(env, *right, wires, PipeEnds::default(), idx + lcount)
            } else {
                skip_range(env, idx + lcount, idx + lcount + rcount);
                Ok(status)
            }
        }
        CommandLine::Connection {
            op: Connector::BgSeq,
            left,
            right,
        } => {
            let lcount = left.leaf_count();
            run_background(env, *left, wires.clone(), idx);
            execute(env, *right, wires, PipeEnds::default(), idx + lcount)
        }
        CommandLine::Background(body) => {
            run_background(env, *body, wires, idx);
            Ok(ExitStatus::from_raw(0))
        }
    }
}

fn run_background(env: &Arc<ExecEnv>, tree: CommandLine, wires: Wires, idx: usize) {
    let count = tree.leaf_count();
    let part_env = Arc::clone(env);
    let handle = thread::spawn(move || {
        if let Err(err) = execute(&part_env, tree, wires, PipeEnds::default(), idx) {
            skip_range(&part_env, idx, idx + count);
            record_error(&part_env, err);
        }
    });
    env.threads.lock().unwrap().push(handle);
}

fn cwd_of(env: &Arc<ExecEnv>, idx: usize) -> Option<PathBuf> {
    env.commands[idx].cwd_path().map(Path::to_owned)
}

fn open_null(output: bool) -> io::Result<File> {
    #[cfg(unix)]
    const NULL_DEVICE: &str = "/dev/null";
    #[cfg(windows)]
    const NULL_DEVICE: &str = "nul";
    if output {
        OpenOptions::new().write(true).open(NULL_DEVICE)
    } else {
        OpenOptions::new().read(true).open(NULL_DEVICE)
    }
}

fn output_wire(binding: Binding, which: &str) -> Result<Wire> {
    match binding {
        Binding::Inherit => Ok(Wire::Inherit),
        Binding::Capture(cap) => Ok(Wire::Capture(cap)),
        Binding::File(file) => Ok(Wire::File(Arc::new(file))),
        Binding::Null => Ok(Wire::File(Arc::new(open_null(true)?))),
        Binding::Feeder(_) => Err(Error::Binding(format!(
            "a Feeder cannot receive {}",
            which
        ))),
    }
}

// Binding conversions for a standalone Command, which has no pipe wiring
// of its own.

pub(crate) fn stdin_end(binding: Binding) -> Result<ChildEnd> {
    match binding {
        Binding::Inherit => Ok(None),
        Binding::File(file) => Ok(Some(Arc::new(file))),
        Binding::Feeder(feeder) => Ok(Some(Arc::new(feeder.reader()?))),
        Binding::Null => Ok(Some(Arc::new(open_null(false)?))),
        Binding::Capture(_) => Err(Error::Binding("a Capture cannot supply stdin".into())),
    }
}

pub(crate) fn output_end(binding: Binding, which: &str) -> Result<ChildEnd> {
    final_end(Some(output_wire(binding, which)?))
}

// Turn a wire into a concrete descriptor for the child, replacing the slot
// in place so later references share the same descriptor.  `fd` identifies
// which parent descriptor an Inherit wire stands for.
fn concretize(wire: &mut Wire, fd: i32) -> Result<Arc<File>> {
    match wire {
        Wire::File(file) => Ok(Arc::clone(file)),
        Wire::Inherit => {
            let file = Arc::new(spawn::dup_inherited(fd)?);
            *wire = Wire::File(Arc::clone(&file));
            Ok(file)
        }
        Wire::Capture(cap) => {
            let (read, write) = spawn::make_pipe()?;
            cap.add_stream(read);
            let file = Arc::new(write);
            *wire = Wire::File(Arc::clone(&file));
            Ok(file)
        }
    }
}

// Apply a node's or group's redirections, in source order, over a slot
// table seeded with the inherited wires.  Descriptor-duplication targets
// (`2>&1`) reference the current contents of the slot table, which is what
// makes swaps via a temporary descriptor (`3>&1 1>&2 2>&3`) come out right.
fn apply_redirects(
    slots: &mut HashMap<i32, Wire>,
    redirects: &[Redirect],
    cwd: Option<&Path>,
) -> Result<()> {
    for redirect in redirects {
        let wire = match &redirect.target {
            RedirectTarget::File(name) => Wire::File(Arc::new(open_redirect_file(
                name,
                redirect.op,
                cwd,
            )?)),
            RedirectTarget::Fd(fd) => {
                let slot = slots.entry(*fd).or_insert(Wire::Inherit);
                Wire::File(concretize(slot, *fd)?)
            }
        };
        slots.insert(redirect.fd, wire);
    }
    Ok(())
}

fn open_redirect_file(name: &str, op: RedirectOp, cwd: Option<&Path>) -> Result<File> {
    let path = Path::new(name);
    let path = match cwd {
        Some(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_owned(),
    };
    let file = match op {
        RedirectOp::Read => OpenOptions::new().read(true).open(&path),
        RedirectOp::Write => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path),
        RedirectOp::Append => OpenOptions::new().append(true).create(true).open(&path),
    };
    file.map_err(|err| {
        Error::Io(io::Error::new(
            err.kind(),
            format!("{}: {}", path.display(), err),
        ))
    })
}

fn slot_table(wires: &Wires) -> HashMap<i32, Wire> {
    HashMap::from([
        (0, wires.stdin.clone()),
        (1, wires.stdout.clone()),
        (2, wires.stderr.clone()),
    ])
}

// Pipe connections override the corresponding slots after a stage's own
// redirections have been applied.
fn apply_pipes(slots: &mut HashMap<i32, Wire>, pipes: PipeEnds) {
    for (fd, end) in [(0, pipes.stdin), (1, pipes.stdout), (2, pipes.stderr)] {
        if let Some(end) = end {
            slots.insert(fd, Wire::File(end));
        }
    }
}

// The wires seen inside a parenthesised group: the group's own redirects
// applied over what the group inherited, then the group's pipe
// connections.  Slots above 2 are dropped; a group cannot export
// temporaries to its body.
fn group_wires(
    wires: Wires,
    redirects: &[Redirect],
    pipes: PipeEnds,
    cwd: Option<PathBuf>,
) -> Result<Wires> {
    let mut slots = slot_table(&wires);
    drop(wires);
    apply_redirects(&mut slots, redirects, cwd.as_deref())?;
    apply_pipes(&mut slots, pipes);
    Ok(Wires {
        stdin: slots.remove(&0).unwrap_or(Wire::Inherit),
        stdout: slots.remove(&1).unwrap_or(Wire::Inherit),
        stderr: slots.remove(&2).unwrap_or(Wire::Inherit),
    })
}

// Resolve one stage's redirections into the three descriptors the child
// will receive.  Temporary slots above 2 are dropped when the table goes
// out of scope, after the Arcs for fds 0..2 have been extracted.
fn resolve_redirects(
    redirects: &[Redirect],
    wires: &Wires,
    pipes: &PipeEnds,
    cwd: Option<&Path>,
) -> Result<(ChildEnd, ChildEnd, ChildEnd)> {
    let mut slots = slot_table(wires);
    apply_redirects(&mut slots, redirects, cwd)?;
    apply_pipes(&mut slots, pipes.clone());
    let stdin = final_end(slots.remove(&0))?;
    let stdout = final_end(slots.remove(&1))?;
    let stderr = final_end(slots.remove(&2))?;
    Ok((stdin, stdout, stderr))
}

fn final_end(wire: Option<Wire>) -> Result<ChildEnd> {
    match wire.unwrap_or(Wire::Inherit) {
        Wire::Inherit => Ok(None),
        Wire::File(file) => Ok(Some(file)),
        Wire::Capture(cap) => {
            let (read, write) = spawn::make_pipe()?;
            cap.add_stream(read);
            Ok(Some(Arc::new(write)))
        }
    }
}

/// Parses and runs a command line synchronously, inheriting the parent's
/// streams.  Shorthand for `Pipeline::new(src).run()`.
pub fn run(src: impl Into<CmdSource>) -> Result<Pipeline> {
    Pipeline::new(src).run()
}

/// Runs a command line with stdout collected into a capture, which is
/// drained and closed before returning.  The capture is available as
/// `pipeline.stdout_capture()`.
pub fn capture_stdout(src: impl Into<CmdSource>) -> Result<Pipeline> {
    let cap = Capture::new();
    let pipeline = Pipeline::new(src).stdout(cap.clone()).run()?;
    cap.close(true);
    Ok(pipeline)
}

/// Runs a command line with stderr collected into a capture, which is
/// drained and closed before returning.  The capture is available as
/// `pipeline.stderr_capture()`.
pub fn capture_stderr(src: impl Into<CmdSource>) -> Result<Pipeline> {
    let cap = Capture::new();
    let pipeline = Pipeline::new(src).stderr(cap.clone()).run()?;
    cap.close(true);
    Ok(pipeline)
}

/// Runs a command line with both stdout and stderr collected into separate
/// captures, drained and closed before returning.
pub fn capture_both(src: impl Into<CmdSource>) -> Result<Pipeline> {
    let out = Capture::new();
    let err = Capture::new();
    let pipeline = Pipeline::new(src)
        .stdout(out.clone())
        .stderr(err.clone())
        .run()?;
    out.close(true);
    err.close(true);
    Ok(pipeline)
}

/// Runs a command line and returns its standard output as text.
pub fn get_stdout(src: impl Into<CmdSource>) -> Result<String> {
    let pipeline = capture_stdout(src)?;
    Ok(pipeline.stdout_capture().expect("capture_stdout sets a capture").text())
}

/// Runs a command line and returns its standard error as text.
pub fn get_stderr(src: impl Into<CmdSource>) -> Result<String> {
    let pipeline = capture_stderr(src)?;
    Ok(pipeline.stderr_capture().expect("capture_stderr sets a capture").text())
}

/// Runs a command line and returns its standard output and error as text.
pub fn get_both(src: impl Into<CmdSource>) -> Result<(String, String)> {
    let pipeline = capture_both(src)?;
    Ok((
        pipeline.stdout_capture().expect("capture_both sets captures").text(),
        pipeline.stderr_capture().expect("capture_both sets captures").text(),
    ))
}
