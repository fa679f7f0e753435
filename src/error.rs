use std::error;
use std::fmt;
use std::io;

/// The error type used throughout the crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The command line is syntactically invalid.
    ///
    /// Reported by [`parse_command_line`] and by `Pipeline::run` before any
    /// subprocess is spawned.
    ///
    /// [`parse_command_line`]: fn.parse_command_line.html
    Parse(String),

    /// A command could not be resolved to an executable.
    ///
    /// The payload is the name of the offending command.
    NotFound(String),

    /// A stream binding is invalid for its position, e.g. a `Capture` bound
    /// to stdin, or a redirection of a stream that is already bound.
    Binding(String),

    /// An operation was attempted on a closed object.
    Closed(&'static str),

    /// `Pipeline::wait_timeout` expired before all children finished.
    Timeout,

    /// An `expect` pattern failed to compile.
    Pattern(regex::Error),

    /// An underlying OS operation failed.
    Io(io::Error),
}

/// Result returned by the functions in this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Error {
        Error::Pattern(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::NotFound(cmd) => write!(f, "Command not found: {}", cmd),
            Error::Binding(msg) => write!(f, "invalid stream binding: {}", msg),
            Error::Closed(what) => write!(f, "{} is closed", what),
            Error::Timeout => write!(f, "timed out waiting for subprocess"),
            Error::Pattern(err) => write!(f, "invalid pattern: {}", err),
            Error::Io(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Pattern(err) => Some(err),
            _ => None,
        }
    }
}
