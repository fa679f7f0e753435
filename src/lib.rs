//! Parsing and execution of shell-like command lines.
//!
//! The entry point to the crate is the [`Pipeline`] type, which parses a
//! command line written in a small shell-like language (pipes `|` and `|&`,
//! sequencing `;`, conditionals `&&` and `||`, grouping `(...)`,
//! redirections, background execution `&`) and executes it itself, without
//! handing the string to a shell.  Every child process remains under
//! programmatic control: standard streams can be bound to [`Capture`]s that
//! buffer output while the children run, or fed interactively through a
//! [`Feeder`], and exit statuses are collected per command.
//!
//! Compared to spawning `sh -c` via `std::process`, this crate offers:
//!
//! * A strict parser that rejects malformed command lines before any process
//!   is started.
//!
//! * Captures with blocking, non-blocking, line-oriented and regex-`expect`
//!   access to child output, while the child is still running.
//!
//! * Operator semantics (`&&`, `||`, `;`, `&`) executed by the library, with
//!   the exit status of every command available afterwards.
//!
//! * Safe shell quoting and formatting helpers for the cases where a string
//!   does have to be handed to a real shell.
//!
//! # Examples
//!
//! Run a pipeline and capture its output:
//!
//! ```no_run
//! # use shpipe::*;
//! # fn dummy() -> shpipe::Result<()> {
//! let out = get_stdout("echo foo | tr a-z A-Z")?;
//! assert_eq!(out, "FOO\n");
//! # Ok(())
//! # }
//! ```
//!
//! Watch the output of a long-running child as it arrives:
//!
//! ```no_run
//! # use shpipe::*;
//! # use std::time::Duration;
//! # fn dummy() -> shpipe::Result<()> {
//! let cap = Capture::with_options(CaptureOptions {
//!     buffer_size: -1,
//!     ..Default::default()
//! });
//! let p = Pipeline::new("tail -f /var/log/syslog")
//!     .stdout(cap.clone())
//!     .run_async()?;
//! if let Some(m) = cap.expect("^.*error.*$", Some(Duration::from_secs(5)))? {
//!     let line = &cap.bytes()[m.start..m.end];
//!     println!("matched: {}", String::from_utf8_lossy(line));
//! }
//! p.commands()[0].terminate()?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Pipeline`]: struct.Pipeline.html
//! [`Capture`]: struct.Capture.html
//! [`Feeder`]: struct.Feeder.html

#![warn(missing_docs)]

mod capture;
mod command;
mod error;
mod feeder;
mod lex;
mod parse;
mod pipeline;
mod process;
mod quote;
mod spawn;

#[cfg(unix)]
mod posix;

#[cfg(windows)]
mod win32;

pub use self::capture::{Capture, CaptureMatch, CaptureOptions};
pub use self::command::{CmdSource, Command};
pub use self::error::{Error, Result};
pub use self::feeder::Feeder;
pub use self::lex::{ShellLexer, Token, TokenKind, get_valid_controls};
pub use self::parse::{
    CommandLine, CommandLineParser, Connector, Node, Redirect, RedirectOp, RedirectTarget,
    parse_command_line,
};
pub use self::pipeline::{
    Binding, Input, Pipeline, capture_both, capture_stderr, capture_stdout, get_both, get_stderr,
    get_stdout, run,
};
pub use self::process::{ExitStatus, Process};
pub use self::quote::{shell_format, shell_quote};

#[cfg(test)]
mod tests {
    mod capture;
    mod command;
    mod feeder;
    mod lex;
    mod parse;
    mod pipeline;
    mod quote;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn public_types_are_send_and_sync() {
        assert_send_sync::<crate::Capture>();
        assert_send_sync::<crate::Command>();
        assert_send_sync::<crate::Feeder>();
        assert_send_sync::<crate::Pipeline>();
        assert_send_sync::<crate::Process>();
        assert_send_sync::<crate::ExitStatus>();
        assert_send_sync::<crate::Error>();
    }
}
