//! Named pipe importer.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tidal_core::{Engine, Shutdown};

use crate::error::{ImportError, Result};
use crate::pump::Pump;
use crate::tcp::{FEED_TIMEOUT, POLL_TICK};

pub struct PipeImporter {
    path: PathBuf,
    file: File,
    feed_timeout: Duration,
}

impl PipeImporter {
    /// Create the FIFO at `path` if needed and open it for non-blocking reads.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| ImportError::InvalidSpec {
            spec: path.display().to_string(),
            reason: "path contains a NUL byte".into(),
        })?;

        // SAFETY: cpath is a valid C string.
        if unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::AlreadyExists {
                return Err(ImportError::io(format!("mkfifo {}", path.display()), err));
            }
        }

        // SAFETY: cpath is a valid C string.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(ImportError::io(
                format!("open {}", path.display()),
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: fd was just opened and is owned by the File from here on.
        let file = unsafe { File::from_raw_fd(fd) };

        tracing::info!(path = %path.display(), "pipe importer opened");
        Ok(Self {
            path,
            file,
            feed_timeout: FEED_TIMEOUT,
        })
    }

    pub fn with_feed_timeout(mut self, timeout: Duration) -> Self {
        self.feed_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read records until the writer closes the pipe, the feed times out or
    /// shutdown is requested.
    pub fn run(mut self, engine: &Engine, shutdown: &Shutdown) -> Result<()> {
        let mut pump = Pump::new(engine, &self.path.display().to_string())?;
        let mut seen_writer = false;

        while shutdown.is_running() {
            if !self.poll_readable()? {
                if pump.idle() > self.feed_timeout {
                    return Err(ImportError::FeedTimeout(self.feed_timeout));
                }
                continue;
            }

            loop {
                match self.file.read(pump.spare()) {
                    Ok(0) if seen_writer => return Err(ImportError::Closed),
                    // No writer has opened the pipe yet.
                    Ok(0) => {
                        std::thread::sleep(POLL_TICK);
                        break;
                    }
                    Ok(n) => {
                        seen_writer = true;
                        pump.commit(n)?;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        seen_writer = true;
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(ImportError::io("read pipe", e)),
                }
            }
        }
        Ok(())
    }

    fn poll_readable(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TICK.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(ImportError::io("poll pipe", err));
        }
        Ok(rc > 0)
    }
}
