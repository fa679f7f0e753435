use std::fs::File;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace};
use regex::bytes::RegexBuilder;

use crate::error::Result;

/// Configuration for a [`Capture`].
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// How reader threads flush into the shared buffer: `0` appends
    /// whatever each read returns (unbuffered), `-1` flushes at newline
    /// boundaries (line-buffered), and a positive value flushes in chunks
    /// of that many bytes (block-buffered).  EOF always flushes the rest.
    pub buffer_size: isize,
    /// The default timeout for blocking reads and `expect`.  `None` blocks
    /// indefinitely.  Individual calls can override this.
    pub timeout: Option<Duration>,
}

impl Default for CaptureOptions {
    fn default() -> CaptureOptions {
        CaptureOptions {
            buffer_size: 0,
            timeout: None,
        }
    }
}

/// The span of a successful [`Capture::expect`] match.
///
/// Index [`Capture::bytes`] with `start..end` to recover the matched text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMatch {
    /// Byte offset of the start of the match.
    pub start: usize,
    /// Byte offset one past the end of the match.
    pub end: usize,
}

struct CaptureState {
    data: Vec<u8>,
    pos: usize,
    streams: usize,
    closed: bool,
    readers: Vec<JoinHandle<()>>,
    match_index: usize,
    match_span: Option<CaptureMatch>,
}

struct Inner {
    state: Mutex<CaptureState>,
    cond: Condvar,
    options: CaptureOptions,
}

/// A thread-safe buffer collecting the output of one or more child streams
/// while the children run.
///
/// Each stream attached with [`add_stream`](Self::add_stream) is drained by
/// a background reader thread into a single append-only byte buffer.  The
/// host consumes the buffer through a forward cursor with
/// [`read`](Self::read), [`readline`](Self::readline), iteration over
/// lines, or [`expect`](Self::expect), which waits for a regex to match the
/// incoming bytes.  The full accumulated contents remain available through
/// [`bytes`](Self::bytes) and [`text`](Self::text).
///
/// `Capture` is a cheap-to-clone handle; clones share the same buffer.
/// Within one source stream, bytes are never reordered; bytes from
/// different simultaneous sources may interleave at arbitrary boundaries.
///
/// # Example
///
/// ```no_run
/// # use shpipe::*;
/// # fn dummy() -> shpipe::Result<()> {
/// let out = Capture::new();
/// let _p = Pipeline::new("echo one; echo two").stdout(out.clone()).run()?;
/// out.close(true);
/// assert_eq!(out.text(), "one\ntwo\n");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Capture {
    inner: Arc<Inner>,
}

impl Default for Capture {
    fn default() -> Capture {
        Capture::new()
    }
}

impl Capture {
    /// Creates an unbuffered capture with no default timeout.
    pub fn new() -> Capture {
        Capture::with_options(CaptureOptions::default())
    }

    /// Creates a capture with the given options.
    pub fn with_options(options: CaptureOptions) -> Capture {
        Capture {
            inner: Arc::new(Inner {
                state: Mutex::new(CaptureState {
                    data: Vec::new(),
                    pos: 0,
                    streams: 0,
                    closed: false,
                    readers: Vec::new(),
                    match_index: 0,
                    match_span: None,
                }),
                cond: Condvar::new(),
                options,
            }),
        }
    }

    /// Attaches a stream and spawns a reader thread that drains it into the
    /// buffer.  Streams can be added at any time before
    /// [`close`](Self::close).
    pub fn add_stream(&self, stream: File) {
        let inner = Arc::clone(&self.inner);
        let buffer_size = self.inner.options.buffer_size;
        let mut state = self.inner.state.lock().unwrap();
        state.streams += 1;
        let handle = thread::spawn(move || {
            reader(&inner, stream, buffer_size);
        });
        state.readers.push(handle);
    }

    /// Reads up to `size` bytes, blocking until they are available, all
    /// streams have finished, or the default timeout expires.  `size` of
    /// `-1` reads everything.
    pub fn read(&self, size: isize) -> Vec<u8> {
        self.read_opts(size, true, None)
    }

    /// Reads up to `size` bytes (everything if `-1`).
    ///
    /// When `block` is true, waits until `size` bytes are available, every
    /// stream has reached EOF, or the timeout (this call's, or else the
    /// capture's default) expires; on timeout whatever is available is
    /// returned.  When `block` is false, returns the currently buffered
    /// bytes without waiting.
    pub fn read_opts(&self, size: isize, block: bool, timeout: Option<Duration>) -> Vec<u8> {
        let deadline = self.deadline(timeout);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let avail = state.data.len() - state.pos;
            let enough = size >= 0 && avail >= size as usize;
            if enough || state.streams == 0 || !block {
                return take(&mut state, size);
            }
            state = match self.wait(state, deadline) {
                (state, false) => state,
                (mut state, true) => return take(&mut state, size),
            };
        }
    }

    /// Reads one line, blocking as [`read`](Self::read) does.
    pub fn readline(&self) -> Vec<u8> {
        self.readline_opts(-1, true, None)
    }

    /// Reads bytes up to and including the next newline, but no more than
    /// `size` bytes if `size` is non-negative.  Blocking and timeouts work
    /// as in [`read_opts`](Self::read_opts); when the streams finish
    /// without a final newline, the remainder is returned as a partial
    /// line.
    pub fn readline_opts(&self, size: isize, block: bool, timeout: Option<Duration>) -> Vec<u8> {
        let deadline = self.deadline(timeout);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let window = &state.data[state.pos..];
            let newline = window.iter().position(|&b| b == b'\n');
            if let Some(at) = newline {
                let mut len = at + 1;
                if size >= 0 {
                    len = len.min(size as usize);
                }
                return take(&mut state, len as isize);
            }
            if size >= 0 && window.len() >= size as usize {
                return take(&mut state, size);
            }
            if state.streams == 0 || !block {
                return take(&mut state, size);
            }
            state = match self.wait(state, deadline) {
                (state, false) => state,
                (mut state, true) => return take(&mut state, size),
            };
        }
    }

    /// Reads all remaining lines.
    pub fn readlines(&self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        loop {
            let line = self.readline();
            if line.is_empty() {
                return lines;
            }
            lines.push(line);
        }
    }

    /// Waits for `pattern` to match the captured bytes as they arrive.
    ///
    /// The pattern is compiled in multi-line mode, so `^` and `$` match at
    /// line boundaries.  Matching starts at the end of the previous
    /// successful match, so repeated `expect` calls walk forward through
    /// the stream.  Returns the match span, or `None` when the timeout
    /// (this call's, or else the capture's default) expires or every
    /// attached stream has ended without a match.
    pub fn expect(
        &self,
        pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<CaptureMatch>> {
        let re = RegexBuilder::new(pattern).multi_line(true).build()?;
        let deadline = self.deadline(timeout);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(m) = re.find_at(&state.data, state.match_index) {
                let span = CaptureMatch {
                    start: m.start(),
                    end: m.end(),
                };
                debug!("expect {:?} matched at {}..{}", pattern, span.start, span.end);
                state.match_index = span.end;
                state.match_span = Some(span);
                return Ok(Some(span));
            }
            // No live stream means no further bytes to match against, the
            // same condition that unblocks read and readline.
            if state.streams == 0 {
                return Ok(None);
            }
            state = match self.wait(state, deadline) {
                (state, false) => state,
                (_, true) => return Ok(None),
            };
        }
    }

    /// The span of the most recent successful [`expect`](Self::expect).
    pub fn match_span(&self) -> Option<CaptureMatch> {
        self.inner.state.lock().unwrap().match_span
    }

    /// All bytes received so far, regardless of the read cursor.
    ///
    /// After `close(true)` this is the complete output of all attached
    /// streams.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.state.lock().unwrap().data.clone()
    }

    /// Like [`bytes`](Self::bytes), decoded as UTF-8 (lossily).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    /// Signals that no further streams will be added.  With `drain` true,
    /// also joins the reader threads, which guarantees that every byte the
    /// children wrote is in the buffer - this blocks until the attached
    /// streams reach EOF.
    pub fn close(&self, drain: bool) {
        let handles = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            self.inner.cond.notify_all();
            if drain {
                std::mem::take(&mut state.readers)
            } else {
                Vec::new()
            }
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or(self.inner.options.timeout)
            .map(|t| Instant::now() + t)
    }

    // Waits on the condition variable; the bool is true if the deadline
    // expired.
    fn wait<'a>(
        &self,
        state: MutexGuard<'a, CaptureState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, CaptureState>, bool) {
        match deadline {
            None => (self.inner.cond.wait(state).unwrap(), false),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (state, true);
                }
                let (state, result) = self
                    .inner
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap();
                (state, result.timed_out() && Instant::now() >= deadline)
            }
        }
    }
}

/// Iterating over a capture yields its lines, blocking like
/// [`readline`](Capture::readline).
impl Iterator for Capture {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let line = self.readline();
        if line.is_empty() { None } else { Some(line) }
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Capture")
            .field("len", &state.data.len())
            .field("pos", &state.pos)
            .field("streams", &state.streams)
            .field("closed", &state.closed)
            .finish()
    }
}

fn take(state: &mut CaptureState, size: isize) -> Vec<u8> {
    let avail = state.data.len() - state.pos;
    let n = if size < 0 {
        avail
    } else {
        avail.min(size as usize)
    };
    let out = state.data[state.pos..state.pos + n].to_vec();
    state.pos += n;
    out
}

fn append(inner: &Inner, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let mut state = inner.state.lock().unwrap();
    state.data.extend_from_slice(bytes);
    inner.cond.notify_all();
}

fn reader(inner: &Inner, mut stream: File, buffer_size: isize) {
    trace!("capture reader starting, buffer_size {}", buffer_size);
    let mut chunk = [0u8; 4096];
    let mut local: Vec<u8> = Vec::new();
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("capture reader error: {}", err);
                break;
            }
        };
        match buffer_size {
            0 => append(inner, &chunk[..n]),
            -1 => {
                // Line buffered: flush through the last complete line.
                local.extend_from_slice(&chunk[..n]);
                if let Some(at) = local.iter().rposition(|&b| b == b'\n') {
                    append(inner, &local[..=at]);
                    local.drain(..=at);
                }
            }
            block => {
                let block = block as usize;
                local.extend_from_slice(&chunk[..n]);
                while local.len() >= block {
                    append(inner, &local[..block]);
                    local.drain(..block);
                }
            }
        }
    }
    append(inner, &local);
    let mut state = inner.state.lock().unwrap();
    state.streams -= 1;
    inner.cond.notify_all();
    trace!("capture reader finished");
}
