use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::spawn;

struct Ends {
    read: Option<File>,
    write: Option<File>,
}

/// A host-controlled producer of bytes for a child's standard input.
///
/// A `Feeder` owns an OS pipe.  Passing it as a pipeline's input installs
/// the read end as the first child's stdin, while the host keeps the write
/// end and pushes bytes into it with [`feed`](Self::feed) whenever it
/// chooses, typically in response to output observed through a [`Capture`].
///
/// [`close`](Self::close) closes both ends, which the child sees as
/// end-of-input; feeding after that fails.
///
/// [`Capture`]: struct.Capture.html
#[derive(Clone)]
pub struct Feeder {
    inner: Arc<Mutex<Ends>>,
}

impl Feeder {
    /// Creates a feeder with a fresh pipe.
    pub fn new() -> Result<Feeder> {
        let (read, write) = spawn::make_pipe()?;
        Ok(Feeder {
            inner: Arc::new(Mutex::new(Ends {
                read: Some(read),
                write: Some(write),
            })),
        })
    }

    /// Writes `data` into the pipe and returns the number of bytes written.
    ///
    /// Blocks if the pipe buffer is full until the child drains it.  Fails
    /// with [`Error::Closed`] after [`close`](Self::close).
    pub fn feed(&self, data: impl AsRef<[u8]>) -> Result<usize> {
        let data = data.as_ref();
        let ends = self.inner.lock().unwrap();
        let mut write = ends.write.as_ref().ok_or(Error::Closed("feeder"))?;
        write.write_all(data)?;
        Ok(data.len())
    }

    /// Closes both ends of the pipe.
    pub fn close(&self) -> Result<()> {
        let mut ends = self.inner.lock().unwrap();
        ends.read.take();
        ends.write.take();
        Ok(())
    }

    /// A duplicate of the read end, for installing as a child's stdin.
    pub(crate) fn reader(&self) -> Result<File> {
        let ends = self.inner.lock().unwrap();
        let read = ends.read.as_ref().ok_or(Error::Closed("feeder"))?;
        Ok(read.try_clone()?)
    }
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ends = self.inner.lock().unwrap();
        f.debug_struct("Feeder")
            .field("closed", &ends.write.is_none())
            .finish()
    }
}
